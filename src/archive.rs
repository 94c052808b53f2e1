//! Signed report archives
//!
//! A report archive is a ZIP holding every submitted file at its original
//! path, the rendered `report.html`, and two signature entries:
//!
//! - `META-INF/MANIFEST.MF`: SHA-256 digest of every payload entry, in path order
//! - `META-INF/SIGNATURE`: base64 HMAC-SHA256 of the manifest under the service key
//!
//! Verification rebuilds the manifest from the payload entries actually
//! present, so a changed byte, a renamed, added or removed entry all break the
//! signature. Only the archive and the key are needed.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::config::SigningKey;
use crate::submission::Submission;

/// Synthetic entry holding the rendered report
pub const REPORT_ENTRY: &str = "report.html";
/// Directory reserved for signature entries
pub const SIGNATURE_DIR: &str = "META-INF/";
pub const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";
pub const SIGNATURE_ENTRY: &str = "META-INF/SIGNATURE";

const MANIFEST_HEADER: &str = "Manifest-Version: 1.0\nCreated-By: codecheck-intake\n\n";

type HmacSha256 = Hmac<Sha256>;

/// Reasons an archive fails verification
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("archive is not a readable zip: {0}")]
    Unreadable(#[from] zip::result::ZipError),
    #[error("archive entry could not be read: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive is not signed")]
    MissingSignature,
    #[error("archive has no report.html entry")]
    MissingReport,
    #[error("archive entry name is not allowed: {0:?}")]
    InvalidEntryName(String),
    #[error("archive contains {0:?} more than once")]
    DuplicateEntry(String),
    #[error("manifest does not match archive entries")]
    ManifestMismatch,
    #[error("signature does not match manifest")]
    BadSignature,
}

/// Entry names the manifest can represent unambiguously
pub fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_control)
}

/// A built and signed report archive
#[derive(Debug, Clone)]
pub struct ReportArchive {
    bytes: Vec<u8>,
}

impl ReportArchive {
    /// Bundle the submission and the rendered report, and sign the result.
    ///
    /// Fails as a whole; no archive is returned if any entry cannot be written.
    pub fn build(submission: &Submission, report_html: &str, key: &SigningKey) -> Result<Self> {
        let mut entries: BTreeMap<String, Vec<u8>> = submission
            .iter()
            .map(|(path, content)| (path.to_string(), content.as_bytes().to_vec()))
            .collect();
        if entries.contains_key(REPORT_ENTRY) {
            anyhow::bail!("Submission already contains {}", REPORT_ENTRY);
        }
        entries.insert(REPORT_ENTRY.to_string(), report_html.as_bytes().to_vec());

        if let Some(name) = entries.keys().find(|name| !is_valid_entry_name(name)) {
            anyhow::bail!("Invalid archive entry name: {:?}", name);
        }

        let manifest = manifest(&entries);
        let signature = keyed_mac(key)
            .map_err(|e| anyhow::anyhow!("Invalid signing key: {}", e))?
            .chain_update(manifest.as_bytes())
            .finalize()
            .into_bytes();

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in &entries {
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("Failed to start archive entry {}", name))?;
            zip.write_all(content)
                .with_context(|| format!("Failed to write archive entry {}", name))?;
        }
        zip.start_file(MANIFEST_ENTRY, options)
            .context("Failed to start manifest entry")?;
        zip.write_all(manifest.as_bytes())
            .context("Failed to write manifest entry")?;
        zip.start_file(SIGNATURE_ENTRY, options)
            .context("Failed to start signature entry")?;
        zip.write_all(general_purpose::STANDARD.encode(signature).as_bytes())
            .context("Failed to write signature entry")?;

        let bytes = zip.finish().context("Failed to finish archive")?.into_inner();

        debug!(
            "Built report archive: entries={}, bytes={}",
            entries.len(),
            bytes.len()
        );

        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base64 form embedded in JSON responses
    pub fn encode(&self) -> String {
        general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Decode the base64 form produced by [`ReportArchive::encode`]
pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(encoded.trim())
        .context("Archive is not valid base64")
}

/// Check an archive's signature and return its payload entries.
///
/// The returned map holds the submitted files and `report.html`; signature
/// entries are not included.
pub fn verify(bytes: &[u8], key: &SigningKey) -> Result<BTreeMap<String, Vec<u8>>, IntegrityError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    let mut entries = BTreeMap::new();
    let mut stored_manifest = None;
    let mut stored_signature = None;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let slot = match name.as_str() {
            MANIFEST_ENTRY => &mut stored_manifest,
            SIGNATURE_ENTRY => &mut stored_signature,
            _ => {
                if !is_valid_entry_name(&name) || name.starts_with(SIGNATURE_DIR) {
                    return Err(IntegrityError::InvalidEntryName(name));
                }
                if entries.insert(name.clone(), content).is_some() {
                    return Err(IntegrityError::DuplicateEntry(name));
                }
                continue;
            }
        };
        if slot.replace(content).is_some() {
            return Err(IntegrityError::DuplicateEntry(name));
        }
    }

    let (Some(stored_manifest), Some(stored_signature)) = (stored_manifest, stored_signature)
    else {
        return Err(IntegrityError::MissingSignature);
    };
    if !entries.contains_key(REPORT_ENTRY) {
        return Err(IntegrityError::MissingReport);
    }

    let manifest = manifest(&entries);
    if manifest.as_bytes() != stored_manifest.as_slice() {
        return Err(IntegrityError::ManifestMismatch);
    }

    let signature = std::str::from_utf8(&stored_signature)
        .ok()
        .and_then(|text| general_purpose::STANDARD.decode(text.trim()).ok())
        .ok_or(IntegrityError::BadSignature)?;

    keyed_mac(key)
        .map_err(|_| IntegrityError::BadSignature)?
        .chain_update(manifest.as_bytes())
        .verify_slice(&signature)
        .map_err(|_| IntegrityError::BadSignature)?;

    Ok(entries)
}

fn keyed_mac(key: &SigningKey) -> Result<HmacSha256, hmac::digest::InvalidLength> {
    <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
}

fn manifest(entries: &BTreeMap<String, Vec<u8>>) -> String {
    let mut out = String::from(MANIFEST_HEADER);
    for (name, content) in entries {
        let digest = general_purpose::STANDARD.encode(Sha256::digest(content));
        out.push_str(&format!("Name: {}\nSHA-256-Digest: {}\n\n", name, digest));
    }
    out
}
