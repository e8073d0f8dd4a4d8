/*
 * store.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Pollhttp, an asynchronous HTTP client with certificate capture.
 *
 * Pollhttp is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Pollhttp is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Pollhttp.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Local trust store: aliased certificates in a passphrase-protected file.
//!
//! Content is XML (root `<truststore>`, one `<certificate alias="...">` per entry holding a
//! PEM block). On disk the XML is encrypted with XChaCha20-Poly1305 under a key derived from
//! the passphrase with PBKDF2-HMAC-SHA256.
//! File format: "PHTS1" + 16-byte salt + 24-byte nonce + ciphertext (with tag).
//! All read-modify-write cycles on store files are serialized process-wide.

use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use pbkdf2::pbkdf2_hmac;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use sha2::Sha256;
use rustls_pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::CertificateDer;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::error::TrustStoreError;

/// Magic header for the encrypted store file (5 bytes).
const STORE_MAGIC: &[u8] = b"PHTS1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 20_000;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

static STORE_LOCK: Mutex<()> = Mutex::new(());

/// Hold while loading, modifying and saving a store file.
pub fn lock_store_files() -> MutexGuard<'static, ()> {
    match STORE_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One aliased certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    pub alias: String,
    pub certificate: CertificateDer<'static>,
}

/// In-memory trust store. Aliases are unique; insertion order is kept.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    entries: Vec<TrustEntry>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn load(path: &Path, passphrase: &str) -> Result<Self, TrustStoreError> {
        let raw = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let plain = decrypt(&raw, passphrase)?;
        let xml = String::from_utf8(plain)
            .map_err(|e| TrustStoreError::Format(format!("decrypted content not UTF-8: {}", e)))?;
        Self::from_xml(&xml)
    }

    /// Encrypt and write to `path` (mode 0o600 on Unix), creating parent directories.
    /// The new content goes to a sibling file first and is renamed over `path`, so the
    /// previous store survives a failed write.
    pub fn save(&self, path: &Path, passphrase: &str) -> Result<(), TrustStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let plain = self.to_xml()?;
        let sealed = encrypt(&plain, passphrase)?;
        let staging = staging_path(path);
        let written = write_store_file(&staging, &sealed);
        if let Err(e) = written.and_then(|()| fs::rename(&staging, path)) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    /// Add or replace the certificate stored under `alias`.
    pub fn set_certificate_entry(&mut self, alias: &str, certificate: CertificateDer<'static>) {
        match self.entries.iter_mut().find(|e| e.alias == alias) {
            Some(entry) => entry.certificate = certificate,
            None => self.entries.push(TrustEntry {
                alias: alias.to_string(),
                certificate,
            }),
        }
    }

    pub fn certificate(&self, alias: &str) -> Option<&CertificateDer<'static>> {
        self.entries
            .iter()
            .find(|e| e.alias == alias)
            .map(|e| &e.certificate)
    }

    pub fn remove(&mut self, alias: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.alias != alias);
        self.entries.len() != before
    }

    /// All certificates, for building a root store.
    pub fn certificates(&self) -> Vec<CertificateDer<'static>> {
        self.entries.iter().map(|e| e.certificate.clone()).collect()
    }

    pub fn entries(&self) -> &[TrustEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_xml(&self) -> Result<Vec<u8>, TrustStoreError> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| TrustStoreError::Xml(e.to_string()))?;
        writer
            .write_event(Event::Start(BytesStart::new("truststore")))
            .map_err(|e| TrustStoreError::Xml(e.to_string()))?;
        for entry in &self.entries {
            let start = BytesStart::new("certificate").with_attributes([("alias", entry.alias.as_str())]);
            writer
                .write_event(Event::Start(start))
                .map_err(|e| TrustStoreError::Xml(e.to_string()))?;
            let pem = encode_pem(&entry.certificate);
            writer
                .write_event(Event::Text(BytesText::new(&pem)))
                .map_err(|e| TrustStoreError::Xml(e.to_string()))?;
            writer
                .write_event(Event::End(BytesEnd::new("certificate")))
                .map_err(|e| TrustStoreError::Xml(e.to_string()))?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("truststore")))
            .map_err(|e| TrustStoreError::Xml(e.to_string()))?;
        Ok(out)
    }

    fn from_xml(content: &str) -> Result<Self, TrustStoreError> {
        let mut reader = Reader::from_str(content);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut store = TrustStore::new();
        let mut current_alias: Option<String> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Err(e) => return Err(TrustStoreError::Xml(e.to_string())),
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    if e.name().as_ref() == b"certificate" {
                        let alias = e
                            .try_get_attribute("alias")
                            .map_err(|e| TrustStoreError::Xml(e.to_string()))?
                            .ok_or_else(|| TrustStoreError::Format("certificate without alias".into()))?
                            .unescape_value()
                            .map_err(|e| TrustStoreError::Xml(e.to_string()))?
                            .into_owned();
                        current_alias = Some(alias);
                    }
                }
                Ok(Event::Text(e)) => {
                    if let Some(alias) = current_alias.take() {
                        let text = e.unescape().map_err(|e| TrustStoreError::Xml(e.to_string()))?;
                        let certificate = decode_pem(&text)?;
                        store.set_certificate_entry(&alias, certificate);
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"certificate" {
                        current_alias = None;
                    }
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(store)
    }
}

/// PEM with 64-column base64 lines.
pub fn encode_pem(certificate: &CertificateDer<'_>) -> String {
    let b64 = STANDARD.encode(certificate.as_ref());
    let mut pem = String::with_capacity(b64.len() + b64.len() / 64 + 64);
    pem.push_str(PEM_BEGIN);
    pem.push('\n');
    for line in b64.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(PEM_END);
    pem
}

/// Decode the first PEM certificate block.
pub fn decode_pem(pem: &str) -> Result<CertificateDer<'static>, TrustStoreError> {
    CertificateDer::from_pem_slice(pem.as_bytes())
        .map_err(|e| TrustStoreError::Format(format!("invalid PEM certificate: {:?}", e)))
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

fn encrypt(plain: &[u8], passphrase: &str) -> Result<Vec<u8>, TrustStoreError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|e| TrustStoreError::Random(e.to_string()))?;
    let key = derive_key(passphrase, &salt);
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| TrustStoreError::Encrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|_| TrustStoreError::Encrypt)?;
    let mut out = Vec::with_capacity(STORE_MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(STORE_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(raw: &[u8], passphrase: &str) -> Result<Vec<u8>, TrustStoreError> {
    if !raw.starts_with(STORE_MAGIC) {
        return Err(TrustStoreError::Format("not a trust store file".into()));
    }
    let header = STORE_MAGIC.len() + SALT_LEN + NONCE_LEN;
    if raw.len() < header + TAG_LEN {
        return Err(TrustStoreError::Format("trust store file too short".into()));
    }
    let salt = &raw[STORE_MAGIC.len()..STORE_MAGIC.len() + SALT_LEN];
    let nonce = XNonce::from_slice(&raw[STORE_MAGIC.len() + SALT_LEN..header]);
    let key = derive_key(passphrase, salt);
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| TrustStoreError::Decrypt)?;
    cipher
        .decrypt(nonce, &raw[header..])
        .map_err(|_| TrustStoreError::Decrypt)
}

/// `.<name>.tmp` next to the store file.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "truststore".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

fn write_store_file(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    let mut f = open_store_file_for_write(path)?;
    f.write_all(content)?;
    f.sync_all()
}

/// Open the store file for writing. On Unix, creates it with mode 0o600 (owner read/write only).
fn open_store_file_for_write(path: &Path) -> Result<File, std::io::Error> {
    #[cfg(unix)]
    {
        use std::fs::OpenOptions;
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .mode(0o600)
            .open(path)
    }
    #[cfg(not(unix))]
    {
        fs::File::create(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(name: &str) -> CertificateDer<'static> {
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .unwrap()
            .cert
            .der()
            .clone()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::load(&dir.path().join("absent"), "changeit").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn saved_entries_load_back_with_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trustcerts");
        let a = cert("a.example");
        let b = cert("b.example");
        let mut store = TrustStore::new();
        store.set_certificate_entry("a.example", a.clone());
        store.set_certificate_entry("b.example", b.clone());
        store.save(&path, "changeit").unwrap();

        let loaded = TrustStore::load(&path, "changeit").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.certificate("a.example"), Some(&a));
        assert_eq!(loaded.certificate("b.example"), Some(&b));
    }

    #[test]
    fn file_is_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustcerts");
        let mut store = TrustStore::new();
        store.set_certificate_entry("host.example", cert("host.example"));
        store.save(&path, "changeit").unwrap();
        let raw = fs::read(&path).unwrap();
        assert!(raw.starts_with(STORE_MAGIC));
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("BEGIN CERTIFICATE"));
        assert!(!text.contains("host.example"));
    }

    #[test]
    fn wrong_passphrase_fails_to_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustcerts");
        TrustStore::new().save(&path, "changeit").unwrap();
        let err = TrustStore::load(&path, "letmein").unwrap_err();
        assert!(matches!(err, TrustStoreError::Decrypt));
    }

    #[test]
    fn set_entry_replaces_existing_alias() {
        let mut store = TrustStore::new();
        let first = cert("h");
        let second = cert("h");
        store.set_certificate_entry("h", first);
        store.set_certificate_entry("h", second.clone());
        assert_eq!(store.len(), 1);
        assert_eq!(store.certificate("h"), Some(&second));
        assert!(store.remove("h"));
        assert!(!store.remove("h"));
    }

    #[test]
    fn pem_decodes_what_it_encodes() {
        let c = cert("pem.example");
        let pem = encode_pem(&c);
        assert!(pem.starts_with(PEM_BEGIN));
        assert!(pem.lines().all(|l| l.len() <= 64 || l.starts_with("-----")));
        assert_eq!(decode_pem(&pem).unwrap(), c);
        assert!(decode_pem("garbage").is_err());
    }

    #[test]
    fn pem_inside_surrounding_text_is_found() {
        let c = cert("wrapped.example");
        let wrapped = format!("leading text\n{}\ntrailing text\n", encode_pem(&c));
        assert_eq!(decode_pem(&wrapped).unwrap(), c);
    }

    #[test]
    fn save_leaves_no_staging_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustcerts");
        let mut store = TrustStore::new();
        store.set_certificate_entry("one.example", cert("one.example"));
        store.save(&path, "changeit").unwrap();
        store.set_certificate_entry("two.example", cert("two.example"));
        store.save(&path, "changeit").unwrap();

        assert!(!staging_path(&path).exists());
        assert_eq!(TrustStore::load(&path, "changeit").unwrap().len(), 2);
    }

    #[test]
    fn failed_save_keeps_previous_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustcerts");
        let first = cert("kept.example");
        let mut store = TrustStore::new();
        store.set_certificate_entry("kept.example", first.clone());
        store.save(&path, "changeit").unwrap();

        // A directory where the staging file should go makes the write fail.
        fs::create_dir(staging_path(&path)).unwrap();
        store.set_certificate_entry("lost.example", cert("lost.example"));
        assert!(matches!(
            store.save(&path, "changeit"),
            Err(TrustStoreError::Io(_))
        ));

        let loaded = TrustStore::load(&path, "changeit").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.certificate("kept.example"), Some(&first));
    }
}
