//! Local terminal handling for attached sessions

use anyhow::Result;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// Ctrl-]
pub const DETACH_KEY: u8 = 0x1d;

/// Raw mode for as long as the guard lives
pub struct RawMode;

impl RawMode {
    pub fn enable() -> Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            tracing::warn!("Failed to restore terminal: {}", e);
        }
    }
}

/// Forward raw stdin chunks until stdin closes or the receiver goes away
pub async fn read_keys(keys: mpsc::Sender<Vec<u8>>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if keys.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("stdin read failed: {}", e);
                break;
            }
        }
    }
}
