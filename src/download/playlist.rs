//! 把 Manifest 写成点播（VOD）m3u8 文件。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use super::models::Manifest;
use crate::base_system::context::safe_fs_name;

/// 分片时长服务端没有给出，统一按这个值写 `#EXTINF`。
pub const NOMINAL_SEGMENT_SECS: u32 = 10;

pub fn render_m3u8(manifest: &Manifest) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-PLAYLIST-TYPE:VOD\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{NOMINAL_SEGMENT_SECS}\n"));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    for entry in &manifest.entries {
        out.push_str(&format!("#EXTINF:{NOMINAL_SEGMENT_SECS}.0,\n{}\n", entry.url));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// `<seriesId>-<videoId>.m3u8`；没有剧集 ID 时只用视频 ID。
pub fn manifest_file_name(series_id: &str, video_id: &str) -> String {
    let stem = if series_id.is_empty() || series_id == video_id {
        video_id.to_string()
    } else {
        format!("{series_id}-{video_id}")
    };
    format!("{}.m3u8", safe_fs_name(&stem, "_", 200))
}

/// 先写临时文件再改名，避免留下半截清单。
pub fn write_manifest(
    dir: &Path,
    series_id: &str,
    video_id: &str,
    manifest: &Manifest,
) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(manifest_file_name(series_id, video_id));
    let tmp = path.with_extension("m3u8.tmp");
    fs::write(&tmp, render_m3u8(manifest)).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
    Ok(path)
}
