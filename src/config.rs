use std::path::PathBuf;

/// Decrypt tool shipped with the vendor's build scripts
pub const DEFAULT_DECRYPT_TOOL: &str = "PC1";
pub const DEFAULT_DECRYPT_KEY: &str = "QNAPNASVERSION4";

/// Simulated NAND chip used to attach UBI images
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// nandsim `first_id_byte` .. `fourth_id_byte`
    pub nandsim_ids: [u8; 4],
    pub mtd_device: PathBuf,
    pub ubi_volume: PathBuf,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            // Micron 2 GiB, 128 KiB erase blocks, 2 KiB pages
            nandsim_ids: [0x2c, 0xd5, 0x90, 0x95],
            mtd_device: PathBuf::from("/dev/mtd0"),
            ubi_volume: PathBuf::from("/dev/ubi0_0"),
        }
    }
}

/// Runtime configuration, read from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub decrypt_tool: String,
    pub decrypt_key: String,
    pub flash: FlashConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            decrypt_tool: DEFAULT_DECRYPT_TOOL.to_string(),
            decrypt_key: DEFAULT_DECRYPT_KEY.to_string(),
            flash: FlashConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `QNAPFW_*` variables, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(tool) = lookup("QNAPFW_DECRYPT_TOOL") {
            config.decrypt_tool = tool;
        }
        if let Some(key) = lookup("QNAPFW_DECRYPT_KEY") {
            config.decrypt_key = key;
        }
        if let Some(ids) = lookup("QNAPFW_NANDSIM_IDS") {
            match parse_nandsim_ids(&ids) {
                Some(ids) => config.flash.nandsim_ids = ids,
                None => tracing::warn!(value = %ids, "ignoring malformed QNAPFW_NANDSIM_IDS"),
            }
        }
        if let Some(mtd) = lookup("QNAPFW_MTD_DEVICE") {
            config.flash.mtd_device = PathBuf::from(mtd);
        }
        if let Some(volume) = lookup("QNAPFW_UBI_VOLUME") {
            config.flash.ubi_volume = PathBuf::from(volume);
        }

        config
    }
}

/// Parse four comma-separated bytes, hex with `0x` prefix or decimal
fn parse_nandsim_ids(value: &str) -> Option<[u8; 4]> {
    let bytes: Vec<u8> = value
        .split(',')
        .map(|part| {
            let part = part.trim();
            match part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
                Some(hex) => u8::from_str_radix(hex, 16).ok(),
                None => part.parse().ok(),
            }
        })
        .collect::<Option<Vec<u8>>>()?;
    bytes.try_into().ok()
}
