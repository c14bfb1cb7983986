use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, IoContext, Result};
use crate::unpack::{Outcome, UnpackReport};

/// One pipeline step as recorded in `report.json`
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: &'static str,
    pub input: PathBuf,
    pub output: PathBuf,
    pub files: usize,
    pub outcome: Outcome,
    pub warnings: Vec<String>,
}

/// Summary of a whole run
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub source: PathBuf,
    pub input_kind: String,
    pub stages: Vec<StageRecord>,
    /// Symlinks created while merging packages
    pub links: Vec<PathBuf>,
}

impl Report {
    pub fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, stage: &'static str, input: &Path, output: &Path, unpacked: UnpackReport) {
        for warning in &unpacked.warnings {
            tracing::warn!(stage, input = %input.display(), "{}", warning);
        }
        self.stages.push(StageRecord {
            stage,
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            files: unpacked.files,
            outcome: unpacked.outcome,
            warnings: unpacked.warnings,
        });
    }

    /// Record a step outcome; fatal errors are handed back to the caller
    pub fn record_result(
        &mut self,
        stage: &'static str,
        input: &Path,
        output: &Path,
        result: Result<UnpackReport>,
    ) -> Result<()> {
        match result {
            Ok(unpacked) => {
                self.record(stage, input, output, unpacked);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.record(stage, input, output, UnpackReport::failed(e.to_string()));
                Ok(())
            }
        }
    }

    pub fn warning_count(&self) -> usize {
        self.stages.iter().map(|s| s.warnings.len()).sum()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path).context_path("creating", path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| Error::Extraction(format!("writing {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_recoverable_errors_become_records() {
        let mut report = Report::new(Path::new("fw.img"));
        let res = report.record_result(
            "rootfs",
            Path::new("rootfs2.bz"),
            Path::new("sysroot"),
            Err(Error::Extraction("corrupt".to_string())),
        );
        assert!(res.is_ok());
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.warning_count(), 1);
        assert!(!report.stages[0].outcome.is_success());
    }

    #[test]
    fn test_fatal_errors_propagate() {
        let mut report = Report::new(Path::new("fw.img"));
        let res = report.record_result(
            "rootfs",
            Path::new("rootfs2.ubi"),
            Path::new("sysroot"),
            Err(Error::FlashDeviceExists(PathBuf::from("/dev/mtd0"))),
        );
        assert!(matches!(res, Err(Error::FlashDeviceExists(_))));
        assert!(report.stages.is_empty());
    }

    #[test]
    fn test_json_shape() {
        let dir = TempDir::new().unwrap();
        let mut report = Report::new(Path::new("fw.img"));
        report.input_kind = "Gzip Compressed".to_string();
        report.record(
            "qpkg",
            Path::new("qpkg.tar"),
            Path::new("qpkg"),
            UnpackReport {
                files: 3,
                warnings: vec![],
                outcome: Outcome::TrailingDataOk,
            },
        );

        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["input_kind"], "Gzip Compressed");
        assert_eq!(value["stages"][0]["stage"], "qpkg");
        assert_eq!(value["stages"][0]["files"], 3);
        assert_eq!(value["stages"][0]["outcome"]["status"], "trailing_data_ok");
    }
}
