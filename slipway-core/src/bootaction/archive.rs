//! Gzip-compressed tar packaging of rendered assets.

use std::io::Write;

use chrono::Utc;
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::{Builder, Header};
use tracing::debug;

use super::render::RenderedAsset;
use crate::design::AssetType;
use crate::error::{Error, Result};

/// Pack unit and file assets into a `.tar.gz`.
///
/// Entries are owned by uid/gid 0 and carry the asset's mode. Paths are
/// stored relative to `/` since tar entries cannot be absolute. Package lists
/// are not files and are skipped.
pub fn pack(assets: &[RenderedAsset]) -> Result<Vec<u8>> {
    let mtime = Utc::now().timestamp().max(0) as u64;
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut entries = 0usize;

    for asset in assets.iter().filter(|a| a.asset_type != AssetType::PkgList) {
        let path = asset
            .path
            .as_deref()
            .map(|p| p.trim_start_matches('/'))
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::render(format!(
                    "boot action '{}' has a {} asset without a path",
                    asset.action_name, asset.asset_type
                ))
            })?;

        let mut header = Header::new_gnu();
        header.set_size(asset.content.len() as u64);
        header.set_mode(asset.permissions);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(mtime);
        builder.append_data(&mut header, path, asset.content.as_slice())?;
        entries += 1;
    }

    let mut gz = builder.into_inner()?;
    gz.flush()?;
    let bytes = gz.finish()?;
    debug!(entries, bytes = bytes.len(), "asset archive built");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tar::Archive;

    fn asset(path: &str, mode: u32, content: &[u8], asset_type: AssetType) -> RenderedAsset {
        RenderedAsset {
            action_name: "hello".into(),
            asset_type,
            path: Some(path.into()),
            permissions: mode,
            content: content.to_vec(),
            package_list: BTreeMap::new(),
        }
    }

    #[test]
    fn unpacked_entries_match_rendered_assets() {
        let assets = vec![
            asset("/etc/hello", 0o644, b"hello world\n", AssetType::File),
            asset("/lib/systemd/system/hello.service", 0o600, b"[Unit]\n", AssetType::Unit),
            asset("/ignored", 0o600, b"", AssetType::PkgList),
        ];
        let bytes = pack(&assets).expect("pack");

        let mut archive = Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut seen = Vec::new();
        for entry in archive.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let path = entry.path().expect("path").to_string_lossy().into_owned();
            let mode = entry.header().mode().expect("mode");
            let uid = entry.header().uid().expect("uid");
            let gid = entry.header().gid().expect("gid");
            let mut content = Vec::new();
            entry.read_to_end(&mut content).expect("read");
            seen.push((path, mode, uid, gid, content));
        }

        assert_eq!(
            seen,
            vec![
                ("etc/hello".to_owned(), 0o644, 0, 0, b"hello world\n".to_vec()),
                (
                    "lib/systemd/system/hello.service".to_owned(),
                    0o600,
                    0,
                    0,
                    b"[Unit]\n".to_vec()
                ),
            ]
        );
    }

    #[test]
    fn file_asset_without_path_fails() {
        let mut a = asset("/x", 0o600, b"x", AssetType::File);
        a.path = None;
        assert!(matches!(pack(&[a]), Err(Error::Render { .. })));
    }
}
