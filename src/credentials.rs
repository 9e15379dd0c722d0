use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

const UUID_FILE: &str = "uuid.txt";
const KEY_FILE: &str = "key.txt";
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(10);

/// REALITY 用の鍵ペア
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// ノード共通の認証情報
#[derive(Debug, Clone)]
pub struct Credentials {
    pub uuid: String,
    pub tuic_password: String,
    pub reality: Option<RealityKeyPair>,
}

impl Credentials {
    /// VLESS-WS のパス
    pub fn ws_path(&self) -> String {
        format!("/{}-vless", self.uuid)
    }
}

/// 作業ディレクトリに保存された UUID を読むか、新規に生成して保存
pub fn load_or_create_uuid(work_dir: &Path) -> Result<String> {
    let path = work_dir.join(UUID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if uuid::Uuid::parse_str(existing).is_ok() {
            return Ok(existing.to_string());
        }
        warn!("Ignoring malformed UUID in {}", path.display());
    }

    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Generated node UUID {}", id);
    Ok(id)
}

/// `generate reality-keypair` の出力から鍵を取り出す
pub fn parse_reality_keypair(text: &str) -> Option<RealityKeyPair> {
    let find = |label: &str| {
        text.lines().find_map(|line| {
            let rest = line.trim().strip_prefix(label)?;
            let rest = rest.trim_start().strip_prefix(':')?;
            rest.split_whitespace().next().map(str::to_string)
        })
    };
    Some(RealityKeyPair {
        private_key: find("PrivateKey")?,
        public_key: find("PublicKey")?,
    })
}

/// キャッシュ済みの鍵ペアを読むか、sing-box で生成する
/// 生成できなければ None（REALITY は無効になる）
pub async fn load_or_generate_reality(work_dir: &Path, singbox_bin: &Path) -> Option<RealityKeyPair> {
    let path = work_dir.join(KEY_FILE);
    if let Ok(cached) = std::fs::read_to_string(&path) {
        if let Some(keys) = parse_reality_keypair(&cached) {
            return Some(keys);
        }
        warn!("Ignoring malformed key file {}", path.display());
    }

    let output = timeout(
        KEYGEN_TIMEOUT,
        Command::new(singbox_bin)
            .args(["generate", "reality-keypair"])
            .kill_on_drop(true)
            .output(),
    )
    .await;

    let text = match output {
        Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
        Ok(Ok(out)) => {
            warn!("REALITY keypair generation exited with {}", out.status);
            return None;
        }
        Ok(Err(e)) => {
            warn!("Failed to run {} for REALITY keys: {}", singbox_bin.display(), e);
            return None;
        }
        Err(_) => {
            warn!("Timed out generating REALITY keys");
            return None;
        }
    };

    let keys = parse_reality_keypair(&text)?;
    if let Err(e) = std::fs::write(&path, &text) {
        warn!("Failed to cache REALITY keys to {}: {}", path.display(), e);
    }
    info!("REALITY key pair ready");
    Some(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reality_keypair() {
        let text = "PrivateKey: aBcD_123\nPublicKey: xYz-789\n";
        let keys = parse_reality_keypair(text).unwrap();
        assert_eq!(keys.private_key, "aBcD_123");
        assert_eq!(keys.public_key, "xYz-789");

        assert!(parse_reality_keypair("PrivateKey: only").is_none());
        assert!(parse_reality_keypair("").is_none());
    }

    #[test]
    fn test_uuid_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_uuid(dir.path()).unwrap();
        let second = load_or_create_uuid(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_malformed_uuid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(UUID_FILE), "not-a-uuid").unwrap();
        let id = load_or_create_uuid(dir.path()).unwrap();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_cached_keys_skip_generation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEY_FILE), "PrivateKey: p\nPublicKey: q\n").unwrap();
        let keys = load_or_generate_reality(dir.path(), Path::new("/nonexistent/sb"))
            .await
            .unwrap();
        assert_eq!(keys.public_key, "q");
    }

    #[tokio::test]
    async fn test_missing_binary_disables_reality() {
        let dir = tempfile::tempdir().unwrap();
        let keys = load_or_generate_reality(dir.path(), Path::new("/nonexistent/sb")).await;
        assert!(keys.is_none());
    }
}
