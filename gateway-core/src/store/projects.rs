//! Per-user project records and attached files
//!
//! `<state>/user-projects/<user>/projects.json` holds the metadata;
//! payloads live beside it under `files/<projectId>/<fileId>`. Project ids
//! come from clients and are validated against a strict pattern before
//! they ever touch a path; file ids are server-generated.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::store::{sanitize_username, write_file_0600};
use crate::now_ms;

/// Maximum projects per user.
const MAX_PROJECTS: usize = 100;

/// Maximum files per project.
const MAX_FILES: usize = 500;

/// Maximum accepted payload size, measured on the base64-encoded form.
const MAX_FILE_BYTES: usize = 35 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFileMeta {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub session_key: String,
    pub added_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub session_keys: Vec<String>,
    #[serde(default)]
    pub files: Vec<ProjectFileMeta>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProjectsFile {
    #[serde(default)]
    projects: Vec<Project>,
}

/// Fields a client may change on an existing project.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub color: Option<String>,
    pub session_keys: Option<Vec<String>>,
}

/// Store over per-user project trees.
pub struct ProjectsStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

/// Validate a client-supplied project id before any path is built from it.
pub fn validate_project_id(id: &str) -> Result<(), GatewayError> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            id.len() <= 64
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidInput(format!("invalid project id {id:?}")))
    }
}

impl ProjectsStore {
    pub fn new(state_dir: &Path) -> Self {
        ProjectsStore {
            dir: state_dir.join("user-projects"),
            lock: Mutex::new(()),
        }
    }

    fn user_dir(&self, username: &str) -> PathBuf {
        self.dir.join(sanitize_username(username))
    }

    fn index_path(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("projects.json")
    }

    fn payload_path(&self, username: &str, project_id: &str, file_id: &str) -> PathBuf {
        self.user_dir(username)
            .join("files")
            .join(project_id)
            .join(file_id)
    }

    fn read_index(&self, username: &str) -> ProjectsFile {
        match fs::read_to_string(self.index_path(username)) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => ProjectsFile::default(),
        }
    }

    fn write_index(&self, username: &str, doc: &ProjectsFile) -> Result<(), GatewayError> {
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| GatewayError::Fatal(format!("projects serialization failed: {e}")))?;
        write_file_0600(&self.index_path(username), &bytes)?;
        Ok(())
    }

    pub async fn list(&self, username: &str) -> Vec<Project> {
        let _guard = self.lock.lock().await;
        self.read_index(username).projects
    }

    pub async fn get(&self, username: &str, project_id: &str) -> Option<Project> {
        let _guard = self.lock.lock().await;
        self.read_index(username)
            .projects
            .into_iter()
            .find(|p| p.id == project_id)
    }

    pub async fn create(
        &self,
        username: &str,
        id: &str,
        name: &str,
        color: &str,
    ) -> Result<Project, GatewayError> {
        validate_project_id(id)?;

        let _guard = self.lock.lock().await;
        let mut doc = self.read_index(username);
        if doc.projects.len() >= MAX_PROJECTS {
            return Err(GatewayError::ResourceLimit(format!(
                "at most {MAX_PROJECTS} projects per user"
            )));
        }
        if doc.projects.iter().any(|p| p.id == id) {
            return Err(GatewayError::Conflict(format!("project {id} already exists")));
        }

        let project = Project {
            id: id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            session_keys: Vec::new(),
            files: Vec::new(),
            created_at: now_ms(),
        };
        doc.projects.push(project.clone());
        self.write_index(username, &doc)?;
        Ok(project)
    }

    pub async fn update(
        &self,
        username: &str,
        project_id: &str,
        update: ProjectUpdate,
    ) -> Result<Project, GatewayError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_index(username);
        let project = doc
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown project {project_id}")))?;

        if let Some(name) = update.name {
            project.name = name;
        }
        if let Some(color) = update.color {
            project.color = color;
        }
        if let Some(session_keys) = update.session_keys {
            project.session_keys = session_keys;
        }
        let updated = project.clone();
        self.write_index(username, &doc)?;
        Ok(updated)
    }

    /// Delete a project along with its stored payloads.
    pub async fn delete(&self, username: &str, project_id: &str) -> Result<(), GatewayError> {
        validate_project_id(project_id)?;

        let _guard = self.lock.lock().await;
        let mut doc = self.read_index(username);
        let before = doc.projects.len();
        doc.projects.retain(|p| p.id != project_id);
        if doc.projects.len() == before {
            return Err(GatewayError::NotFound(format!("unknown project {project_id}")));
        }
        self.write_index(username, &doc)?;

        let payload_dir = self.user_dir(username).join("files").join(project_id);
        if payload_dir.exists() {
            let _ = fs::remove_dir_all(&payload_dir);
        }
        Ok(())
    }

    /// Attach a payload to a project. `data_base64` is the encoded upload;
    /// the 35 MB cap applies to the encoded length, matching what clients
    /// are told before they send.
    pub async fn add_file(
        &self,
        username: &str,
        project_id: &str,
        file_name: &str,
        mime_type: &str,
        session_key: &str,
        data_base64: &str,
    ) -> Result<ProjectFileMeta, GatewayError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        validate_project_id(project_id)?;
        if data_base64.len() > MAX_FILE_BYTES {
            return Err(GatewayError::ResourceLimit(format!(
                "file payload exceeds {MAX_FILE_BYTES} encoded bytes"
            )));
        }
        let data = STANDARD
            .decode(data_base64)
            .map_err(|_| GatewayError::InvalidInput("file payload is not base64".to_string()))?;

        let _guard = self.lock.lock().await;
        let mut doc = self.read_index(username);
        let project = doc
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown project {project_id}")))?;
        if project.files.len() >= MAX_FILES {
            return Err(GatewayError::ResourceLimit(format!(
                "at most {MAX_FILES} files per project"
            )));
        }

        let mut id_bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id_bytes);
        let file_id = hex::encode(id_bytes);

        let meta = ProjectFileMeta {
            id: file_id.clone(),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: data.len() as u64,
            session_key: session_key.to_string(),
            added_at: now_ms(),
        };
        project.files.push(meta.clone());

        let payload_path = self.payload_path(username, project_id, &file_id);
        write_file_0600(&payload_path, &data)?;
        self.write_index(username, &doc)?;
        Ok(meta)
    }

    pub async fn read_file(
        &self,
        username: &str,
        project_id: &str,
        file_id: &str,
    ) -> Result<(ProjectFileMeta, Vec<u8>), GatewayError> {
        validate_project_id(project_id)?;

        let _guard = self.lock.lock().await;
        let doc = self.read_index(username);
        let meta = doc
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .and_then(|p| p.files.iter().find(|f| f.id == file_id))
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("unknown file {file_id}")))?;

        let data = fs::read(self.payload_path(username, project_id, &meta.id))
            .map_err(|e| GatewayError::Io(e.to_string()))?;
        Ok((meta, data))
    }

    pub async fn remove_file(
        &self,
        username: &str,
        project_id: &str,
        file_id: &str,
    ) -> Result<(), GatewayError> {
        validate_project_id(project_id)?;

        let _guard = self.lock.lock().await;
        let mut doc = self.read_index(username);
        let project = doc
            .projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown project {project_id}")))?;
        let before = project.files.len();
        project.files.retain(|f| f.id != file_id);
        if project.files.len() == before {
            return Err(GatewayError::NotFound(format!("unknown file {file_id}")));
        }
        self.write_index(username, &doc)?;
        let _ = fs::remove_file(self.payload_path(username, project_id, file_id));
        Ok(())
    }
}
