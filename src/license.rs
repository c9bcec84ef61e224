//! Install the FreeSurfer license file where the tool expects it.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::platform::PlatformClient;

/// Project `info` key holding pasted license text.
const PROJECT_LICENSE_KEY: &str = "FREESURFER_LICENSE";

/// Install the license at `license_path`. The text is found in one of three
/// places, in this order: an input file, the license config string (space
/// separated), or the project's info metadata reached through the client.
pub fn install_freesurfer_license(
    input_license_path: Option<&Path>,
    license_text: Option<&str>,
    client: &dyn PlatformClient,
    destination_id: &str,
    license_path: &Path,
) -> Result<()> {
    tracing::debug!("Looking for Freesurfer license");

    if license_path.exists() {
        tracing::debug!("{} exists.", license_path.display());
    }

    if let Some(input) = input_license_path {
        if license_path.file_name().and_then(|name| name.to_str()) != Some("license.txt")
        {
            tracing::warn!(
                "Freesurfer license file is usually license.txt, not {}",
                license_path.display()
            );
        }
        ensure_parent(license_path)?;
        fs::copy(input, license_path).with_context(|| {
            format!("copy {} to {}", input.display(), license_path.display())
        })?;
        tracing::info!("Using FreeSurfer license in input file.");
        return Ok(());
    }

    if let Some(text) = license_text.filter(|text| !text.trim().is_empty()) {
        write_license(license_path, &space_separated_to_lines(text))?;
        tracing::info!("Using FreeSurfer license in gear argument.");
        return Ok(());
    }

    // Last resort: the project's info metadata.
    let project_id = client
        .get_container(destination_id)
        .ok()
        .and_then(|destination| destination.parents.project);
    if let Some(project_id) = project_id {
        if let Ok(Some(text)) = client.project_info_value(&project_id, PROJECT_LICENSE_KEY)
        {
            write_license(license_path, &space_separated_to_lines(&text))?;
            tracing::info!("Using FreeSurfer license in project info.");
            return Ok(());
        }
    }

    Err(anyhow!(
        "Could not find FreeSurfer license anywhere ({})",
        license_path.display()
    ))
}

/// License text arrives space separated when pasted into a config string;
/// the tool wants one field per line.
fn space_separated_to_lines(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("\n")
}

fn write_license(license_path: &Path, text: &str) -> Result<()> {
    ensure_parent(license_path)?;
    fs::write(license_path, text)
        .with_context(|| format!("write {}", license_path.display()))?;
    tracing::debug!("Wrote license file {}", license_path.display());
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
            tracing::debug!("Created directory {}", parent.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ContainerInfo, ContainerParents, StaticClient};

    #[test]
    fn input_file_is_copied_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("uploaded.txt");
        fs::write(&input, "user@example.com\n12345\n *key\n").unwrap();
        let dest = dir.path().join("freesurfer/license.txt");

        install_freesurfer_license(
            Some(&input),
            None,
            &StaticClient::new(),
            "dest",
            &dest,
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "user@example.com\n12345\n *key\n"
        );
    }

    #[test]
    fn config_string_is_reflowed_onto_lines() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("license.txt");
        install_freesurfer_license(
            None,
            Some("user@example.com 12345 *key =hash"),
            &StaticClient::new(),
            "dest",
            &dest,
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "user@example.com\n12345\n*key\n=hash"
        );
    }

    #[test]
    fn project_info_is_the_last_resort() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("license.txt");
        let client = StaticClient::new()
            .with_container(ContainerInfo {
                id: "dest".to_string(),
                container_type: "analysis".to_string(),
                label: "a".to_string(),
                parents: ContainerParents {
                    project: Some("proj".to_string()),
                    ..ContainerParents::default()
                },
                parent_type: Some("project".to_string()),
            })
            .with_project_info("proj", PROJECT_LICENSE_KEY, "user@example.com 99 *k");
        install_freesurfer_license(None, None, &client, "dest", &dest).unwrap();
        assert!(fs::read_to_string(&dest)
            .unwrap()
            .starts_with("user@example.com\n"));
    }

    #[test]
    fn all_sources_missing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("license.txt");
        let result =
            install_freesurfer_license(None, None, &StaticClient::new(), "dest", &dest);
        assert!(result.is_err());
    }
}
