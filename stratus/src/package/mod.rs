//! Computation packaging.
//!
//! Turns a user-supplied computation value into a [`ComputationImage`]:
//! an opaque serialized payload plus a dependency manifest, a return
//! type tag and a stable name. The controller never inspects the
//! payload; the cluster side deserializes and executes it.
//!
//! Packaging performs static validation before any network traffic:
//! fatal diagnostics fail with `ControllerError::Compilation`, a payload
//! that cannot be serialized fails with
//! `ControllerError::NotSerializable`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ControllerError;

/// Payload size above which packaging emits a warning (4 MiB).
const PAYLOAD_WARN_BYTES: usize = 4 * 1024 * 1024;

/// Dependency size above which packaging emits a warning (64 MiB).
const DEPENDENCY_WARN_BYTES: u64 = 64 * 1024 * 1024;

/// One entry of a dependency manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    /// Identifier of the staged assembly.
    pub assembly_id: String,
    /// Size of the staged content in bytes.
    pub size: u64,
    /// Hex sha256 of the staged content.
    pub hash: String,
}

/// Dependency content staged for upload alongside an image.
#[derive(Debug, Clone)]
pub struct StagedDependency {
    /// Identifier of the assembly.
    pub assembly_id: String,
    /// Raw content; hashed and measured during packaging.
    pub content: Vec<u8>,
}

impl StagedDependency {
    /// Stage raw content under an assembly id.
    pub fn new(assembly_id: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            assembly_id: assembly_id.into(),
            content,
        }
    }
}

/// Serialized, dependency-complete submission payload for a cloud
/// process. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationImage {
    /// The controller that packaged the image.
    pub client_id: Uuid,
    /// Image name; content-addressed when the caller gave none.
    pub name: String,
    /// Opaque serialized computation.
    pub payload: Vec<u8>,
    /// Tag describing the computation's return type.
    pub return_type_tag: String,
    /// Transitive dependency manifest.
    pub dependencies: Vec<DependencyRef>,
}

/// A packaged image together with non-fatal diagnostics.
#[derive(Debug, Clone)]
pub struct PackageOutcome {
    /// The image ready for submission.
    pub image: ComputationImage,
    /// Non-fatal static diagnostics.
    pub warnings: Vec<String>,
}

/// Packages computation values into submission images.
#[derive(Debug, Clone)]
pub struct ComputationPackager {
    client_id: Uuid,
}

impl ComputationPackager {
    /// Create a packager that stamps images with `client_id`.
    pub fn new(client_id: Uuid) -> Self {
        Self { client_id }
    }

    /// Package a computation under a caller-chosen name.
    pub fn package_named<T: Serialize>(
        &self,
        computation: &T,
        name: &str,
        return_type_tag: &str,
        dependencies: Vec<StagedDependency>,
    ) -> Result<PackageOutcome, ControllerError> {
        self.build(computation, Some(name), return_type_tag, dependencies)
    }

    /// Package a computation, assigning a content-addressed name.
    pub fn package<T: Serialize>(
        &self,
        computation: &T,
        return_type_tag: &str,
        dependencies: Vec<StagedDependency>,
    ) -> Result<PackageOutcome, ControllerError> {
        self.build(computation, None, return_type_tag, dependencies)
    }

    fn build<T: Serialize>(
        &self,
        computation: &T,
        name: Option<&str>,
        return_type_tag: &str,
        dependencies: Vec<StagedDependency>,
    ) -> Result<PackageOutcome, ControllerError> {
        // Serialization failure is reported before any static analysis:
        // a non-portable payload can never leave the client.
        let payload = bincode::serialize(computation)
            .map_err(|e| ControllerError::NotSerializable(e.to_string()))?;

        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if return_type_tag.trim().is_empty() {
            errors.push("return type tag must not be empty".to_string());
        }
        if payload.len() > PAYLOAD_WARN_BYTES {
            warnings.push(format!(
                "payload is {} bytes; large closures slow down submission",
                payload.len()
            ));
        }

        let mut manifest = Vec::with_capacity(dependencies.len());
        for (i, dep) in dependencies.iter().enumerate() {
            if dep.assembly_id.trim().is_empty() {
                errors.push(format!("dependency #{i} has an empty assembly id"));
                continue;
            }
            if dependencies[..i]
                .iter()
                .any(|d| d.assembly_id == dep.assembly_id)
            {
                errors.push(format!(
                    "duplicate dependency assembly id '{}'",
                    dep.assembly_id
                ));
                continue;
            }
            let size = dep.content.len() as u64;
            if size == 0 {
                warnings.push(format!("dependency '{}' is empty", dep.assembly_id));
            }
            if size > DEPENDENCY_WARN_BYTES {
                warnings.push(format!(
                    "dependency '{}' is {} bytes; consider staging it in the store",
                    dep.assembly_id, size
                ));
            }
            manifest.push(DependencyRef {
                assembly_id: dep.assembly_id.clone(),
                size,
                hash: hex_digest(&dep.content),
            });
        }

        if !errors.is_empty() {
            return Err(ControllerError::Compilation(errors.join("; ")));
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => format!("proc-{}", &hex_digest(&payload)[..12]),
        };

        Ok(PackageOutcome {
            image: ComputationImage {
                client_id: self.client_id,
                name,
                payload,
                return_type_tag: return_type_tag.to_string(),
                dependencies: manifest,
            },
            warnings,
        })
    }
}

/// Hex-encoded sha256 of `data`.
fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
