//! bzip2 snapshots of the SQLite database for transfer through the file store.
//!
//! Both directions stream through `async-compression`, writing to a sibling temp
//! file that is renamed into place once the stream has been flushed.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_compression::tokio::bufread::BzDecoder;
use async_compression::tokio::write::BzEncoder;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use uuid::Uuid;

fn temp_sibling(path: &Path) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    Ok(parent.join(format!(".{}.snapshot.tmp", Uuid::new_v4())))
}

async fn commit_temp(temp: &Path, dst: &Path) -> anyhow::Result<()> {
    if let Err(err) = fs::rename(temp, dst).await {
        let _ = fs::remove_file(temp).await;
        return Err(err).with_context(|| format!("renaming {} -> {}", temp.display(), dst.display()));
    }
    Ok(())
}

/// Compresses `src` into `dst` with bzip2. Returns the compressed size.
pub async fn compress_file(src: &Path, dst: &Path) -> anyhow::Result<u64> {
    let input = File::open(src)
        .await
        .with_context(|| format!("opening {}", src.display()))?;
    let temp = temp_sibling(dst)?;
    let output = File::create(&temp)
        .await
        .with_context(|| format!("creating {}", temp.display()))?;

    let mut reader = BufReader::new(input);
    let mut encoder = BzEncoder::new(output);
    tokio::io::copy(&mut reader, &mut encoder)
        .await
        .with_context(|| format!("compressing {}", src.display()))?;
    encoder.shutdown().await.context("finishing bzip2 stream")?;
    drop(encoder);

    commit_temp(&temp, dst).await?;
    let size = fs::metadata(dst).await?.len();
    debug!(src = %src.display(), dst = %dst.display(), size, "snapshot compressed");
    Ok(size)
}

/// Decompresses the bzip2 file `src` into `dst`. Returns the decompressed size.
pub async fn decompress_file(src: &Path, dst: &Path) -> anyhow::Result<u64> {
    let input = File::open(src)
        .await
        .with_context(|| format!("opening {}", src.display()))?;
    let temp = temp_sibling(dst)?;
    let mut output = File::create(&temp)
        .await
        .with_context(|| format!("creating {}", temp.display()))?;

    let mut decoder = BzDecoder::new(BufReader::new(input));
    let size = match tokio::io::copy(&mut decoder, &mut output).await {
        Ok(size) => size,
        Err(err) => {
            drop(output);
            let _ = fs::remove_file(&temp).await;
            return Err(err).with_context(|| format!("decompressing {}", src.display()));
        }
    };
    output.flush().await?;
    drop(output);

    commit_temp(&temp, dst).await?;
    debug!(src = %src.display(), dst = %dst.display(), size, "snapshot decompressed");
    Ok(size)
}

/// Streaming SHA-256 of a file, hex encoded.
pub async fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
