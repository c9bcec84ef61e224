//! Determine the level at which the job is running.

use crate::platform::{ContainerInfo, PlatformClient};

/// Hierarchy depth at which this invocation is scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLevel {
    Project,
    Subject,
    Session,
    Acquisition,
    NoParent,
    NoDestination,
}

impl RunLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunLevel::Project => "project",
            RunLevel::Subject => "subject",
            RunLevel::Session => "session",
            RunLevel::Acquisition => "acquisition",
            RunLevel::NoParent => "no_parent",
            RunLevel::NoDestination => "no_destination",
        }
    }
}

/// Resolved labels for every level of the destination's hierarchy.
///
/// Labels for levels the destination does not have are "unknown <level>"
/// placeholders rather than absent, so downstream formatting stays total.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub run_level: RunLevel,
    pub run_label: String,
    pub group: String,
    pub project_label: String,
    pub subject_label: String,
    pub session_label: String,
    pub acquisition_label: String,
}

impl Hierarchy {
    /// Key/value rows in display order, used by the tree annotation.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("run_level", self.run_level.as_str().to_string()),
            ("run_label", self.run_label.clone()),
            ("group", self.group.clone()),
            ("project_label", self.project_label.clone()),
            ("subject_label", self.subject_label.clone()),
            ("session_label", self.session_label.clone()),
            ("acquisition_label", self.acquisition_label.clone()),
        ]
    }
}

fn label_or_unknown(
    client: &dyn PlatformClient,
    container_id: Option<&String>,
    level: &str,
) -> String {
    match container_id {
        Some(id) => match client.get_container(id) {
            Ok(container) => container.label,
            Err(err) => {
                tracing::warn!("could not resolve {level} {id}: {err}");
                format!("unknown {level}")
            }
        },
        None => format!("unknown {level}"),
    }
}

/// Determine the run level and all hierarchy labels for a destination.
///
/// A destination without a parent classifies as `no_parent`; a destination
/// the API cannot return at all classifies as `no_destination`.
pub fn get_run_level_and_hierarchy(
    client: &dyn PlatformClient,
    destination_id: &str,
) -> Hierarchy {
    let destination = match client.get_container(destination_id) {
        Ok(destination) => destination,
        Err(err) => {
            tracing::error!("Unable to get level and hierarchy: {err}");
            return Hierarchy {
                run_level: RunLevel::NoDestination,
                run_label: "unknown".to_string(),
                group: "unknown group".to_string(),
                project_label: "unknown project".to_string(),
                subject_label: "unknown subject".to_string(),
                session_label: "unknown session".to_string(),
                acquisition_label: "unknown acquisition".to_string(),
            };
        }
    };

    let run_level = run_level_of(&destination);
    tracing::info!("run_level = {}", run_level.as_str());

    let group = destination
        .parents
        .group
        .clone()
        .unwrap_or_else(|| "unknown group".to_string());
    tracing::info!("group = {group}");

    let project_label =
        label_or_unknown(client, destination.parents.project.as_ref(), "project");
    tracing::info!("project_label = {project_label}");

    let subject_label =
        label_or_unknown(client, destination.parents.subject.as_ref(), "subject");
    tracing::info!("subject_label = {subject_label}");

    let session_label =
        label_or_unknown(client, destination.parents.session.as_ref(), "session");
    tracing::info!("session_label = {session_label}");

    let acquisition_label = label_or_unknown(
        client,
        destination.parents.acquisition.as_ref(),
        "acquisition",
    );
    tracing::info!("acquisition_label = {acquisition_label}");

    let run_label = match run_level {
        RunLevel::Project => project_label.clone(),
        RunLevel::Subject => subject_label.clone(),
        RunLevel::Session => session_label.clone(),
        RunLevel::Acquisition => acquisition_label.clone(),
        RunLevel::NoParent | RunLevel::NoDestination => "unknown".to_string(),
    };

    Hierarchy {
        run_level,
        run_label,
        group,
        project_label,
        subject_label,
        session_label,
        acquisition_label,
    }
}

fn run_level_of(destination: &ContainerInfo) -> RunLevel {
    match destination.parent_type.as_deref() {
        Some("project") => RunLevel::Project,
        Some("subject") => RunLevel::Subject,
        Some("session") => RunLevel::Session,
        Some("acquisition") => RunLevel::Acquisition,
        Some(other) => {
            tracing::warn!("unrecognized parent type {other}");
            RunLevel::NoParent
        }
        None => RunLevel::NoParent,
    }
}
