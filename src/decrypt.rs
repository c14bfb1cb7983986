use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, IoContext, Result};
use crate::mount::run_tool;

/// Turns an encrypted firmware image into the vendor's gzip tarball
pub trait Decryptor {
    /// Decrypt `ciphertext` into `plaintext`, leaving the input untouched
    fn decrypt(&self, ciphertext: &Path, plaintext: &Path) -> Result<()>;
}

/// The vendor's `PC1` tool, which decrypts a file in place
pub struct Pc1Decryptor {
    tool: String,
    key: String,
}

impl Pc1Decryptor {
    pub fn new(tool: &str, key: &str) -> Self {
        Self {
            tool: tool.to_string(),
            key: key.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.decrypt_tool, &config.decrypt_key)
    }

    /// The command an operator can run by hand
    pub fn manual_command(&self, ciphertext: &Path) -> String {
        format!("{} d {} {}", self.tool, self.key, ciphertext.display())
    }

    fn locate(&self) -> Option<PathBuf> {
        find_program(&self.tool)
    }
}

/// Resolve a program name the way the shell would
pub fn find_program(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

impl Decryptor for Pc1Decryptor {
    fn decrypt(&self, ciphertext: &Path, plaintext: &Path) -> Result<()> {
        let tool = self.locate().ok_or_else(|| Error::DecryptToolMissing {
            tool: self.tool.clone(),
            command: self.manual_command(ciphertext),
        })?;

        fs::copy(ciphertext, plaintext).context_path("copying", ciphertext)?;
        tracing::info!(tool = %tool.display(), image = %ciphertext.display(), "decrypting");
        run_tool(
            &tool.to_string_lossy(),
            &["d", self.key.as_str(), &*plaintext.to_string_lossy()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_missing_tool_names_manual_command() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("TS-X51_20200101-4.4.1.img");
        fs::write(&image, [0xaau8; 64]).unwrap();

        let decryptor = Pc1Decryptor::new("/nonexistent/PC1", "QNAPNASVERSION4");
        let err = decryptor
            .decrypt(&image, &dir.path().join("out.tgz"))
            .unwrap_err();
        assert!(err.is_fatal());
        match err {
            Error::DecryptToolMissing { command, .. } => {
                assert_eq!(
                    command,
                    format!("/nonexistent/PC1 d QNAPNASVERSION4 {}", image.display())
                );
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!dir.path().join("out.tgz").exists());
    }

    #[test]
    fn test_runs_tool_on_copy() {
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("fake-pc1");
        // stand-in that "decrypts" by appending a marker to its third argument
        fs::write(&tool, "#!/bin/sh\nprintf decrypted >> \"$3\"\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let image = dir.path().join("fw.img");
        fs::write(&image, b"cipher-").unwrap();
        let out = dir.path().join("fw.tgz");

        Pc1Decryptor::new(&tool.to_string_lossy(), "KEY")
            .decrypt(&image, &out)
            .unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"cipher-decrypted");
        assert_eq!(fs::read(&image).unwrap(), b"cipher-");
    }

    #[test]
    fn test_find_program_in_path() {
        assert!(find_program("sh").is_some());
        assert!(find_program("qnapfw-surely-not-installed").is_none());
    }
}
