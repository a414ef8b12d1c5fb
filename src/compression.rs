//! Shrinking large payloads before they are cached.
//!
//! Freshly fetched bytes are staged to a file so a [`CompressionTransform`] can size them up
//! through the [`FileSystem`] abstraction. The factor `n` it returns means "keep 1/n"; a
//! [`Downscaler`] applies it before the payload reaches the disk tier and the decoder.

use crate::error::Result;
use crate::key::CacheKey;
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn size(&self, path: &Path) -> io::Result<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}

/// Maps a staged payload to its shrink factor. Factors below 2 leave the payload untouched.
pub type CompressionTransform = Arc<dyn Fn(&Path, &dyn FileSystem) -> u32 + Send + Sync>;

/// One extra step of shrinking per `step_kb` kilobytes: a file of `kb` kilobytes larger than
/// `step_kb` gets factor `kb / step_kb + 1`, anything else (or a missing file) gets 1.
pub fn size_step(step_kb: u64) -> CompressionTransform {
    let step_kb = step_kb.max(1);
    Arc::new(move |path: &Path, file_system: &dyn FileSystem| {
        if !file_system.exists(path) {
            return 1;
        }
        let kb = file_system
            .size(path)
            .map(|bytes| bytes / 1000)
            .unwrap_or_default();
        if kb > step_kb {
            u32::try_from(kb / step_kb + 1).unwrap_or(u32::MAX)
        } else {
            1
        }
    })
}

/// Applies a shrink factor to a payload.
pub trait Downscaler: Send + Sync {
    fn downscale(&self, key: &CacheKey, data: Bytes, factor: u32) -> Result<Bytes>;
}

/// Keeps every `factor`-th byte, leaving `ceil(len / factor)` bytes.
///
/// Format-agnostic; for encoded images supply a [`Downscaler`] that resamples pixels instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrideDownscaler;

impl Downscaler for StrideDownscaler {
    fn downscale(&self, _key: &CacheKey, data: Bytes, factor: u32) -> Result<Bytes> {
        if factor <= 1 {
            return Ok(data);
        }
        let stride = factor as usize;
        Ok(data.iter().step_by(stride).copied().collect::<Vec<u8>>().into())
    }
}
