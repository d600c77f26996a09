use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::lengths::Lengths;

pub type InfoHash = [u8; 20];

/// A parsed and validated .torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    pub name: String,
    pub info_hash: InfoHash,
    pub piece_hashes: Vec<InfoHash>,
    /// Slash-separated path (starting with the torrent name for multi-file
    /// torrents) and length of each file, in torrent order.
    pub files: Vec<(String, u64)>,
    pub lengths: Lengths,
}

#[derive(Deserialize)]
struct RawTorrent {
    info: serde_bencode::value::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct RawInfo {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<RawFile>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct RawFile {
    pub length: u64,
    pub path: Vec<String>,
}

fn validate_component(c: &str) -> anyhow::Result<()> {
    if c.is_empty() || c == "." || c == ".." || c.contains('/') || c.contains('\0') {
        bail!("invalid path component {c:?}");
    }
    Ok(())
}

/// Join the components of a file path under the torrent name. Empty and "."
/// components are dropped.
fn file_path(name: &str, components: &[String]) -> anyhow::Result<String> {
    let mut path = name.to_owned();
    for c in components.iter().filter(|c| !c.is_empty() && *c != ".") {
        validate_component(c)?;
        path.push('/');
        path.push_str(c);
    }
    if path.len() == name.len() {
        bail!("file with empty path {components:?}");
    }
    Ok(path)
}

impl TorrentMeta {
    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Self> {
        let raw: RawTorrent = serde_bencode::from_bytes(buf)
            .inspect_err(|e| trace!("error deserializing torrent: {e:#}"))
            .context("error parsing torrent")?;
        let info_bytes =
            serde_bencode::to_bytes(&raw.info).context("error re-encoding info dict")?;
        let info_hash: InfoHash = Sha1::digest(&info_bytes).into();
        let info: RawInfo =
            serde_bencode::from_bytes(&info_bytes).context("error parsing info dict")?;
        Self::from_info(info, info_hash)
    }

    fn from_info(info: RawInfo, info_hash: InfoHash) -> anyhow::Result<Self> {
        validate_component(&info.name).context("bad torrent name")?;

        let files = match (info.length, info.files) {
            (Some(len), None) => vec![(info.name.clone(), len)],
            (None, Some(files)) => files
                .into_iter()
                .map(|f| Ok((file_path(&info.name, &f.path)?, f.length)))
                .collect::<anyhow::Result<Vec<_>>>()?,
            (Some(..), Some(..)) => bail!("torrent has both \"length\" and \"files\""),
            (None, None) => bail!("torrent has neither \"length\" nor \"files\""),
        };

        let total = files.iter().map(|(_, len)| *len).sum();
        let lengths = Lengths::new(total, info.piece_length)?;

        if info.pieces.len() % 20 != 0 {
            bail!("pieces length {} is not a multiple of 20", info.pieces.len());
        }
        let piece_hashes: Vec<InfoHash> = info
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();
        if piece_hashes.len() != lengths.total_pieces() as usize {
            bail!(
                "expected {} piece hashes, got {}",
                lengths.total_pieces(),
                piece_hashes.len()
            );
        }

        Ok(Self {
            name: info.name,
            info_hash,
            piece_hashes,
            files,
            lengths,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Fetch the contents of a .torrent given as a path or an http(s) URL.
pub fn load_torrent_bytes(location: &str) -> anyhow::Result<Vec<u8>> {
    if location.starts_with("magnet:") {
        bail!("magnet links are not supported, pass a .torrent file or its URL");
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        debug!(url = location, "downloading torrent");
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("btfs/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("error building HTTP client")?;
        let response = client
            .get(location)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("error downloading {location}"))?;
        return Ok(response
            .bytes()
            .with_context(|| format!("error reading response body from {location}"))?
            .to_vec());
    }
    std::fs::read(location).with_context(|| format!("error reading {location}"))
}
