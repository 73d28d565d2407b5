use fuser::MountOption;
use thiserror::Error;

/// Default FUSE subtype, shown as `fuse.sparse` in the mount table.
const DEFAULT_SUBTYPE: &str = "sparse";

/// Errors from `-o` option parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    /// A write-enabling option was requested.
    #[error("mount option '{0}' is not supported on a read-only filesystem")]
    ReadWrite(String),

    /// A `key=value` option was given without a value.
    #[error("mount option '{0}' needs a value")]
    MissingValue(String),
}

/// How the filesystem is presented to the kernel.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Source shown in the mount table.
    pub fs_name: String,
    /// FUSE subtype.
    pub subtype: String,
    /// Extra options passed through to the kernel.
    pub options: Vec<MountOption>,
}

impl MountConfig {
    pub fn new(fs_name: impl Into<String>) -> Self {
        Self {
            fs_name: fs_name.into(),
            subtype: DEFAULT_SUBTYPE.to_string(),
            options: Vec::new(),
        }
    }

    /// Apply comma-separated `-o` option strings.
    ///
    /// `fsname=` and `subtype=` replace the configured values; everything
    /// else is appended once.
    pub fn with_options<S: AsRef<str>>(mut self, specs: &[S]) -> Result<Self, OptionError> {
        for option in parse_mount_options(specs)? {
            match option {
                MountOption::FSName(name) => self.fs_name = name,
                MountOption::Subtype(subtype) => self.subtype = subtype,
                other => {
                    if !self.options.contains(&other) {
                        self.options.push(other);
                    }
                }
            }
        }
        Ok(self)
    }

    /// Full option list for the mount call. Always read-only.
    pub fn mount_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::RO,
            MountOption::FSName(self.fs_name.clone()),
            MountOption::Subtype(self.subtype.clone()),
        ];
        options.extend(
            self.options
                .iter()
                .filter(|option| **option != MountOption::RO)
                .cloned(),
        );
        options
    }
}

/// Parse `-o` option strings into typed mount options.
///
/// Unknown options pass through as [`MountOption::CUSTOM`].
pub fn parse_mount_options<S: AsRef<str>>(specs: &[S]) -> Result<Vec<MountOption>, OptionError> {
    let mut options = Vec::new();
    for spec in specs {
        for option in spec
            .as_ref()
            .split(',')
            .map(str::trim)
            .filter(|option| !option.is_empty())
        {
            options.push(parse_option(option)?);
        }
    }
    Ok(options)
}

fn parse_option(option: &str) -> Result<MountOption, OptionError> {
    let parsed = match option {
        "ro" => MountOption::RO,
        "rw" => return Err(OptionError::ReadWrite(option.to_string())),
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        _ => match option.split_once('=') {
            Some((key @ ("fsname" | "subtype"), "")) => {
                return Err(OptionError::MissingValue(key.to_string()))
            }
            Some(("fsname", value)) => MountOption::FSName(value.to_string()),
            Some(("subtype", value)) => MountOption::Subtype(value.to_string()),
            _ => MountOption::CUSTOM(option.to_string()),
        },
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_and_custom_options() {
        let options = parse_mount_options(&["allow_other,noexec", "max_read=131072"]).unwrap();
        assert_eq!(
            options,
            vec![
                MountOption::AllowOther,
                MountOption::NoExec,
                MountOption::CUSTOM("max_read=131072".to_string()),
            ]
        );
    }

    #[test]
    fn test_rw_is_rejected() {
        let err = parse_mount_options(&["ro,rw"]).unwrap_err();
        assert_eq!(err, OptionError::ReadWrite("rw".to_string()));
    }

    #[test]
    fn test_fsname_needs_value() {
        let err = parse_mount_options(&["fsname="]).unwrap_err();
        assert_eq!(err, OptionError::MissingValue("fsname".to_string()));
    }

    #[test]
    fn test_config_always_read_only() {
        let config = MountConfig::new("system.img")
            .with_options(&["ro,subtype=android,allow_root,allow_root"])
            .unwrap();

        assert_eq!(config.subtype, "android");
        assert_eq!(
            config.mount_options(),
            vec![
                MountOption::RO,
                MountOption::FSName("system.img".to_string()),
                MountOption::Subtype("android".to_string()),
                MountOption::AllowRoot,
            ]
        );
    }
}
