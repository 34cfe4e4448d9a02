use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use crate::error::{Error, Result, Stage};

fn temp_path(out: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(out.file_name().unwrap_or_else(|| "stofold".as_ref()));
    name.push(".tmp");
    out.with_file_name(name)
}

/// Write a finished artifact. `None` goes to stdout; a file is written
/// beside its destination and renamed into place, so readers never see a
/// partial artifact.
pub async fn write_artifact(out: Option<&Path>, bytes: &[u8], stage: Stage) -> Result<()> {
    let io = |e| Error::io(stage, e);
    let Some(out) = out else {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(bytes).await.map_err(io)?;
        stdout.flush().await.map_err(io)?;
        return Ok(());
    };

    let tmp = temp_path(out);
    let written = async {
        let file = File::create(&tmp).await?;
        let mut bufwriter = BufWriter::new(file);
        bufwriter.write_all(bytes).await?;
        bufwriter.flush().await?;
        bufwriter.shutdown().await?;
        tokio::fs::rename(&tmp, out).await
    }
    .await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io(e));
    }
    info!(path = %out.display(), bytes = bytes.len(), "wrote artifact");
    Ok(())
}
