//! Placeholder outputs for dry-run mode.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::context::GearContext;
use crate::metadata::MetadataRecord;

const PLACEHOLDER_HTML: &str = "<html>\n  <head>\n    <meta http-equiv=\"content-type\" \
content=\"text/html; charset=UTF-8\">\n    <title>dry run</title>\n  </head>\n  <body>\n  \
<h1>dry run</h1>\n  <p>This output was produced without running the command.</p>\n  \
</body>\n</html>\n";

fn touch(path: &Path) -> Result<()> {
    if path.exists() {
        tracing::debug!("Exists: {}", path.display());
        return Ok(());
    }
    tracing::debug!("Creating: {}", path.display());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, b"").with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Make some output like the command would have, only fake, so the
/// packaging and metadata paths downstream have something to chew on.
pub fn pretend_it_ran(
    context: &GearContext,
    subject_id: &str,
    metadata: &mut MetadataRecord,
) -> Result<()> {
    let work = &context.work_dir;
    tracing::info!("Creating fake output in {}", work.display());
    touch(&work.join("somedir/d3.js"))?;
    touch(&work.join(format!(
        "reportlets/recon-all/{subject_id}/anat/{subject_id}_desc-about_T1w.html"
    )))?;

    let analysis_dir = context.analysis_output_dir(subject_id);
    tracing::info!("Creating fake output in {}", analysis_dir.display());
    touch(&analysis_dir.join("logs/CITATION.md"))?;
    touch(&analysis_dir.join(format!("{subject_id}/mri/aseg.mgz")))?;
    touch(&analysis_dir.join("freesurfer/fsaverage/mri/subcort.prob.log"))?;

    let html = analysis_dir.join(format!("{subject_id}.html"));
    if let Some(parent) = html.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&html, PLACEHOLDER_HTML)
        .with_context(|| format!("write {}", html.display()))?;
    tracing::debug!("Creating: {}", html.display());

    metadata.insert("dry_run", "note", "no command was run");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GearConfig;
    use crate::context::Destination;
    use std::collections::BTreeMap;

    #[test]
    fn creates_placeholders_and_metadata_marker() {
        let dir = tempfile::tempdir().unwrap();
        let context = GearContext {
            base_dir: dir.path().to_path_buf(),
            input_dir: dir.path().join("input"),
            output_dir: dir.path().join("output"),
            work_dir: dir.path().join("work"),
            subjects_dir: dir.path().join("subjects"),
            freesurfer_home: dir.path().join("freesurfer"),
            destination: Destination::default(),
            config: GearConfig::default(),
            inputs: BTreeMap::new(),
            environ: BTreeMap::new(),
        };
        let mut metadata = MetadataRecord::new();

        pretend_it_ran(&context, "sub-01", &mut metadata).unwrap();

        assert!(context.work_dir.join("somedir/d3.js").is_file());
        assert!(context
            .output_dir
            .join("sub-01/logs/CITATION.md")
            .is_file());
        assert!(context.output_dir.join("sub-01/sub-01.html").is_file());
        assert!(!metadata.is_empty());
    }
}
