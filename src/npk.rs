//! # NPK Package Reader
//!
//! An NPK is a tar archive bundling everything needed to install and
//! run one container:
//!
//! | Entry           | Content                                        |
//! |-----------------|------------------------------------------------|
//! | `meta.json`     | Package format version                         |
//! | `hashes.json`   | Digests of the manifest and filesystem image   |
//! | `manifest.json` | Container manifest (see [`crate::manifest`])   |
//! | `fs.img`        | Compressed tar of the container root filesystem|
//!
//! ## Verification Model
//!
//! [`Npk::open`] streams over the archive once, recomputes the SHA-256
//! of the manifest entry and compares it against `hashes.json`. The
//! filesystem image is NOT verified at open time; its digest covers the
//! decompressed image bytes and is checked lazily while the image is
//! unpacked at mount time ([`Npk::unpack_image`]). A digest mismatch at
//! either point is [`Error::VerificationFailed`] and nothing partial
//! survives.
//!
//! Verification never materializes the image in memory. Digests are
//! computed over fixed-size chunks so arbitrarily large packages stay
//! at constant memory cost.
//!
//! A single [`Npk`] handle is safe for concurrent read-only inspection;
//! unpacking opens its own file handle per call.

use crate::constants::{DIGEST_CHUNK_SIZE, MAX_HASHES_SIZE, MAX_MANIFEST_SIZE};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current package format version.
pub const NPK_FORMAT_VERSION: u32 = 1;

const META_NAME: &str = "meta.json";
const HASHES_NAME: &str = "hashes.json";
const MANIFEST_NAME: &str = "manifest.json";
const IMAGE_NAME: &str = "fs.img";

// =============================================================================
// Package Sections
// =============================================================================

/// Package metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Package format version.
    pub version: u32,
}

/// Digest section of a package.
///
/// Digests are lowercase hex SHA-256. `fs_hash` covers the
/// *decompressed* image bytes, so the check is independent of the
/// compression codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashes {
    /// Digest of the raw `manifest.json` bytes.
    pub manifest_hash: String,
    /// Digest of the decompressed filesystem image.
    pub fs_hash: String,
    /// Compression codec of `fs.img`.
    pub compression: Compression,
}

/// Compression codecs a package may declare for its image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Gzip,
    None,
    /// Codec this runtime cannot decompress. The tag is preserved so
    /// the resulting error can name it.
    #[serde(untagged)]
    Unknown(String),
}

// =============================================================================
// Npk
// =============================================================================

/// Verified handle over a package archive.
///
/// Owns the path to the underlying archive; the manifest section is
/// verified once at open and cached, the image section lazily at
/// unpack.
#[derive(Debug, Clone)]
pub struct Npk {
    path: PathBuf,
    meta: Meta,
    hashes: Hashes,
    manifest: Manifest,
    /// Byte offset and length of the image section within the archive.
    image: (u64, u64),
}

impl Npk {
    /// Opens a package archive and verifies its manifest section.
    ///
    /// Streams over the archive once. The filesystem image is located
    /// but not read.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArchive`] for malformed archives or missing
    /// entries, [`Error::VerificationFailed`] if the manifest digest
    /// does not match, [`Error::ManifestInvalid`] if the manifest
    /// fails validation.
    pub fn open(path: &Path) -> Result<Npk> {
        let file = File::open(path).map_err(|e| Error::io(format!("open {}", path.display()), e))?;
        let mut archive = tar::Archive::new(file);

        let mut meta = None;
        let mut hashes: Option<Hashes> = None;
        let mut manifest_bytes = None;
        let mut image = None;

        let entries = archive
            .entries()
            .map_err(|e| Error::InvalidArchive(format!("not a tar archive: {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| Error::InvalidArchive(format!("corrupt entry: {e}")))?;
            let name = entry
                .path()
                .map_err(|e| Error::InvalidArchive(format!("entry path: {e}")))?
                .to_string_lossy()
                .into_owned();
            match name.as_str() {
                META_NAME => {
                    let bytes = read_bounded(&mut entry, MAX_HASHES_SIZE, META_NAME)?;
                    meta = Some(
                        serde_json::from_slice::<Meta>(&bytes)
                            .map_err(|e| Error::InvalidArchive(format!("meta: {e}")))?,
                    );
                }
                HASHES_NAME => {
                    let bytes = read_bounded(&mut entry, MAX_HASHES_SIZE, HASHES_NAME)?;
                    hashes = Some(
                        serde_json::from_slice::<Hashes>(&bytes)
                            .map_err(|e| Error::InvalidArchive(format!("hashes: {e}")))?,
                    );
                }
                MANIFEST_NAME => {
                    manifest_bytes =
                        Some(read_bounded(&mut entry, MAX_MANIFEST_SIZE, MANIFEST_NAME)?);
                }
                IMAGE_NAME => {
                    image = Some((entry.raw_file_position(), entry.size()));
                }
                other => {
                    return Err(Error::InvalidArchive(format!("unexpected entry '{other}'")));
                }
            }
        }

        let meta = meta.ok_or_else(|| Error::InvalidArchive(format!("missing {META_NAME}")))?;
        let hashes =
            hashes.ok_or_else(|| Error::InvalidArchive(format!("missing {HASHES_NAME}")))?;
        let manifest_bytes = manifest_bytes
            .ok_or_else(|| Error::InvalidArchive(format!("missing {MANIFEST_NAME}")))?;
        let image = image.ok_or_else(|| Error::InvalidArchive(format!("missing {IMAGE_NAME}")))?;

        if meta.version != NPK_FORMAT_VERSION {
            return Err(Error::InvalidArchive(format!(
                "unsupported package format version {}",
                meta.version
            )));
        }

        // SECURITY: the manifest is only parsed after its digest checks
        // out. A tampered manifest never reaches the JSON parser.
        let digest = hex::encode(Sha256::digest(&manifest_bytes));
        if digest != hashes.manifest_hash {
            return Err(Error::VerificationFailed(format!(
                "manifest digest mismatch: expected {}, got {digest}",
                hashes.manifest_hash
            )));
        }

        let manifest = Manifest::parse(&manifest_bytes)?;
        debug!(
            "opened package {} ({} image bytes)",
            manifest.container(),
            image.1
        );

        Ok(Npk {
            path: path.to_owned(),
            meta,
            hashes,
            manifest,
            image,
        })
    }

    /// Returns the archive path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the package metadata.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Returns the digest section.
    pub fn hashes(&self) -> &Hashes {
        &self.hashes
    }

    /// Returns the verified manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Unpacks the filesystem image into `dest`, verifying its digest.
    ///
    /// The digest is computed over the decompressed bytes as they are
    /// unpacked. On mismatch the destination tree is removed and
    /// [`Error::VerificationFailed`] is returned, so a tampered image
    /// never goes live.
    pub fn unpack_image(&self, dest: &Path) -> Result<()> {
        let reader = self.image_reader()?;
        let mut digest = DigestReader::new(reader);

        std::fs::create_dir_all(dest)
            .map_err(|e| Error::io(format!("create {}", dest.display()), e))?;
        let unpacked = tar::Archive::new(&mut digest).unpack(dest);

        let result = unpacked
            .map_err(|e| Error::InvalidArchive(format!("image: {e}")))
            .and_then(|()| {
                // Drain trailing padding so the digest covers every byte.
                digest.drain()?;
                let actual = hex::encode(digest.finalize());
                if actual == self.hashes.fs_hash {
                    Ok(())
                } else {
                    Err(Error::VerificationFailed(format!(
                        "image digest mismatch: expected {}, got {actual}",
                        self.hashes.fs_hash
                    )))
                }
            });

        if result.is_err() {
            // Best effort. The engine never exposes a partial root.
            let _ = std::fs::remove_dir_all(dest);
        }
        result
    }

    /// Verifies the image digest without unpacking anything.
    pub fn verify_image(&self) -> Result<()> {
        let mut reader = self.image_reader()?;
        let mut hasher = Sha256::new();
        let mut chunk = vec![0u8; DIGEST_CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut chunk)
                .map_err(|e| Error::io("read image", e))?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
        }
        let actual = hex::encode(hasher.finalize());
        if actual == self.hashes.fs_hash {
            Ok(())
        } else {
            Err(Error::VerificationFailed(format!(
                "image digest mismatch: expected {}, got {actual}",
                self.hashes.fs_hash
            )))
        }
    }

    /// Returns a reader over the decompressed image bytes.
    fn image_reader(&self) -> Result<Box<dyn Read + Send>> {
        let mut file = File::open(&self.path)
            .map_err(|e| Error::io(format!("open {}", self.path.display()), e))?;
        file.seek(SeekFrom::Start(self.image.0))
            .map_err(|e| Error::io("seek image", e))?;
        let section = file.take(self.image.1);
        match &self.hashes.compression {
            Compression::Gzip => Ok(Box::new(GzDecoder::new(section))),
            Compression::None => Ok(Box::new(section)),
            Compression::Unknown(codec) => Err(Error::UnsupportedCompression(codec.clone())),
        }
    }
}

/// Reads an entry with a hard size bound.
fn read_bounded<R: Read>(reader: &mut R, max: usize, what: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let n = reader
        .take(max as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| Error::io(format!("read {what}"), e))?;
    if n > max {
        return Err(Error::InvalidArchive(format!(
            "{what} exceeds {max} bytes"
        )));
    }
    Ok(bytes)
}

/// Read adapter that hashes every byte passing through it.
struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Consumes any bytes the tar reader left unread.
    fn drain(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; DIGEST_CHUNK_SIZE];
        loop {
            let n = self
                .read(&mut chunk)
                .map_err(|e| Error::io("drain image", e))?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    fn finalize(self) -> impl AsRef<[u8]> {
        self.hasher.finalize()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

// =============================================================================
// Packing
// =============================================================================

/// Builds an NPK archive from a manifest and a root filesystem tree.
///
/// Writes `<name>-<version>.npk` into `out` and returns its path.
/// Primarily used by the packaging tool and tests.
pub fn pack(manifest: &Manifest, root: &Path, out: &Path) -> Result<PathBuf> {
    let manifest_bytes = manifest.to_bytes()?;

    // Image: tar of the root tree, digested decompressed, then gzipped.
    let mut image_tar = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut image_tar);
        builder
            .append_dir_all(".", root)
            .map_err(|e| Error::io(format!("pack {}", root.display()), e))?;
        builder.finish().map_err(|e| Error::io("finish image", e))?;
    }
    let fs_hash = hex::encode(Sha256::digest(&image_tar));
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&image_tar)
        .map_err(|e| Error::io("compress image", e))?;
    let image = encoder.finish().map_err(|e| Error::io("compress image", e))?;

    let meta = Meta {
        version: NPK_FORMAT_VERSION,
    };
    let hashes = Hashes {
        manifest_hash: hex::encode(Sha256::digest(&manifest_bytes)),
        fs_hash,
        compression: Compression::Gzip,
    };

    let npk_path = out.join(format!("{}-{}.npk", manifest.name, manifest.version));
    let file = File::create(&npk_path)
        .map_err(|e| Error::io(format!("create {}", npk_path.display()), e))?;
    let mut builder = tar::Builder::new(file);
    append_bytes(&mut builder, META_NAME, &serde_json::to_vec(&meta)?)?;
    append_bytes(&mut builder, HASHES_NAME, &serde_json::to_vec(&hashes)?)?;
    append_bytes(&mut builder, MANIFEST_NAME, &manifest_bytes)?;
    append_bytes(&mut builder, IMAGE_NAME, &image)?;
    builder.finish().map_err(|e| Error::io("finish package", e))?;

    Ok(npk_path)
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, bytes)
        .map_err(|e| Error::io(format!("append {name}"), e))
}
