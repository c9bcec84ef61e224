//! End-to-end dry runs of the gear binary against temporary gear layouts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::json;

struct GearFixture {
    _dir: tempfile::TempDir,
    gear_dir: PathBuf,
    subjects_dir: PathBuf,
}

impl GearFixture {
    fn new(config: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let gear_dir = dir.path().join("gear");
        let subjects_dir = dir.path().join("subjects");
        fs::create_dir_all(gear_dir.join("input/anatomical")).expect("create input");
        fs::create_dir_all(&subjects_dir).expect("create subjects dir");
        fs::write(
            gear_dir.join("config.json"),
            serde_json::to_string_pretty(&config).expect("serialize config"),
        )
        .expect("write config.json");
        GearFixture {
            _dir: dir,
            gear_dir,
            subjects_dir,
        }
    }

    fn anatomical_dir(&self) -> PathBuf {
        self.gear_dir.join("input/anatomical")
    }

    fn output_dir(&self) -> PathBuf {
        self.gear_dir.join("output")
    }

    fn run(&self) -> (Output, String) {
        let output = Command::new(env!("CARGO_BIN_EXE_recon-gear"))
            .arg("--gear-dir")
            .arg(&self.gear_dir)
            .arg("--subjects-dir")
            .arg(&self.subjects_dir)
            .arg("--environ-file")
            .arg(self.gear_dir.join("no_such_environ.json"))
            .arg("--freesurfer-home")
            .arg(self.gear_dir.join("freesurfer"))
            .output()
            .expect("run recon-gear");
        let mut log = String::from_utf8_lossy(&output.stdout).to_string();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        (output, log)
    }
}

fn dry_run_config(subject_id: &str) -> serde_json::Value {
    json!({
        "config": {
            "gear-dry-run": true,
            "gear-log-level": "DEBUG",
            "gear-FREESURFER_LICENSE": "user@example.com 12345 *key =hash",
            "subject_id": subject_id,
            "reconall_options": "-all -qcache",
            "parallel": true
        },
        "destination": {"id": "5db3392669d4f3002a16ec4c", "type": "analysis"}
    })
}

fn write_previous_run_archive(dest: &Path, subject: &str) {
    let file = fs::File::create(dest).expect("create archive");
    let mut writer = zip::ZipWriter::new(file);
    for name in [
        format!("{subject}/mri/T1.mgz"),
        format!("{subject}/surf/lh.pial"),
    ] {
        writer
            .start_file(name, zip::write::FileOptions::default())
            .expect("start entry");
        writer.write_all(b"x").expect("write entry");
    }
    writer.finish().expect("finish archive");
}

#[test]
fn dry_run_with_single_nifti_builds_the_fresh_command() {
    let fixture = GearFixture::new(dry_run_config("sub1"));
    fs::write(fixture.anatomical_dir().join("T1w_MPR.nii.gz"), b"x")
        .expect("write nifti");

    let (output, log) = fixture.run();

    assert!(output.status.success(), "gear failed:\n{log}");
    assert!(log.contains("dry-run"), "expected dry-run warning:\n{log}");
    assert!(log.contains("command is:"), "no command line logged:\n{log}");
    assert!(log.contains("T1w_MPR.nii.gz"));
    assert!(log.contains("-subjid sub1"));
    assert!(log.contains("-all -qcache"));
    assert!(log.contains("-openmp"));
    assert!(log.contains("-parallel"));

    // The dry-run placeholders were zipped and the raw directory removed.
    assert!(fixture
        .output_dir()
        .join("freesurfer-recon-all_sub1_5db3392669d4f3002a16ec4c.zip")
        .is_file());
    assert!(!fixture.output_dir().join("sub1").exists());

    let metadata =
        fs::read_to_string(fixture.output_dir().join(".metadata.json")).expect("metadata");
    let value: serde_json::Value = serde_json::from_str(&metadata).expect("parse metadata");
    assert_eq!(
        value["analysis"]["info"]["dry_run"]["note"],
        "no command was run"
    );
}

#[test]
fn previous_run_archive_resumes_with_subjid_only() {
    let fixture = GearFixture::new(dry_run_config("ignored-config-id"));
    write_previous_run_archive(
        &fixture
            .anatomical_dir()
            .join("freesurfer-recon-all_sub1.zip"),
        "sub1",
    );

    let (output, log) = fixture.run();

    assert!(output.status.success(), "gear failed:\n{log}");
    assert!(
        fixture.subjects_dir.join("sub1/mri/T1.mgz").is_file(),
        "archive was not unpacked into the subjects dir"
    );

    let command_line = log
        .lines()
        .find(|line| line.contains("command is:"))
        .expect("no command line logged");
    assert!(command_line.contains("-subjid sub1"));
    assert!(!command_line.contains(" -i "), "resume must not pass inputs");

    assert!(fixture
        .output_dir()
        .join("freesurfer-recon-all_sub1_5db3392669d4f3002a16ec4c.zip")
        .is_file());
}

#[test]
fn missing_input_exits_nonzero_without_packaging() {
    let fixture = GearFixture::new(dry_run_config("sub1"));
    // input/anatomical exists but is empty: nothing to reconstruct from.

    let (output, log) = fixture.run();

    assert!(!output.status.success(), "gear should have failed:\n{log}");
    assert!(log.contains("Anatomical input could not be found"));
    // Fatal input errors bypass packaging entirely.
    let zips: Vec<_> = fs::read_dir(fixture.output_dir())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    entry.path().extension().and_then(|ext| ext.to_str()) == Some("zip")
                })
                .collect()
        })
        .unwrap_or_default();
    assert!(zips.is_empty(), "no archive should be produced");
}

#[test]
fn extra_anatomical_inputs_are_forwarded() {
    let fixture = GearFixture::new(dry_run_config("sub1"));
    fs::write(fixture.anatomical_dir().join("T1w_MPR.nii.gz"), b"x")
        .expect("write nifti");
    let second = fixture.gear_dir.join("input/t1w_anatomical_2");
    fs::create_dir_all(&second).expect("create aux dir");
    fs::write(second.join("T1w_MPR.nii.gz"), b"x").expect("write aux nifti");
    let t2 = fixture.gear_dir.join("input/t2w_anatomical");
    fs::create_dir_all(&t2).expect("create t2 dir");
    fs::write(t2.join("T2w.nii.gz"), b"x").expect("write t2 nifti");

    let (output, log) = fixture.run();

    assert!(output.status.success(), "gear failed:\n{log}");
    let command_line = log
        .lines()
        .find(|line| line.contains("command is:"))
        .expect("no command line logged");
    assert_eq!(command_line.matches(" -i ").count(), 2);
    assert!(command_line.contains("-T2"));
    assert!(command_line.contains("t1w_anatomical_2"));
}
