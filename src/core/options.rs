//! Purpose: Recorder configuration for the three memory spaces and buffer growth.
//! Exports: `RecorderOptions`, `SpaceOptions`.
//! Role: Loaded from JSON (serde) or built in code; validated before a manager is created.
//! Invariants: Missing JSON fields fall back to defaults; unknown fields are rejected.
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpaceOptions {
    /// Minimum size of a newly allocated buffer.
    pub buffer_size: usize,
    /// Requests above this size fail with `Exhausted`.
    pub max_buffer_size: usize,
    /// Free buffers retained after a drain pass; the rest are deallocated.
    pub cache_count: usize,
    pub prealloc_count: usize,
    /// Upper bound on live buffers in the space.
    pub limit: usize,
}

impl SpaceOptions {
    pub fn global() -> Self {
        Self {
            buffer_size: 512 * KIB,
            max_buffer_size: 64 * MIB,
            cache_count: 2,
            prealloc_count: 2,
            limit: 64,
        }
    }

    pub fn thread_local() -> Self {
        Self {
            buffer_size: 4 * KIB,
            max_buffer_size: 16 * MIB,
            cache_count: 16,
            prealloc_count: 4,
            limit: 4096,
        }
    }

    pub fn virtual_thread_local() -> Self {
        Self {
            buffer_size: KIB,
            max_buffer_size: 16 * MIB,
            cache_count: 8,
            prealloc_count: 0,
            limit: 65536,
        }
    }

    fn validate(&self, name: &str) -> Result<(), Error> {
        if self.buffer_size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{name}.buffer_size must be positive")));
        }
        if self.max_buffer_size < self.buffer_size {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{name}.max_buffer_size is below buffer_size")));
        }
        if self.limit == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{name}.limit must be positive")));
        }
        if self.prealloc_count > self.limit || self.cache_count > self.limit {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("{name} prealloc/cache counts exceed limit")));
        }
        Ok(())
    }
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self::thread_local()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecorderOptions {
    pub global: SpaceOptions,
    pub thread_local: SpaceOptions,
    pub virtual_thread_local: SpaceOptions,
    /// Multiplier applied to renewal requests to amortize later growth.
    pub growth_factor: usize,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            global: SpaceOptions::global(),
            thread_local: SpaceOptions::thread_local(),
            virtual_thread_local: SpaceOptions::virtual_thread_local(),
            growth_factor: 2,
        }
    }
}

impl RecorderOptions {
    pub fn validate(&self) -> Result<(), Error> {
        self.global.validate("global")?;
        self.thread_local.validate("thread_local")?;
        self.virtual_thread_local.validate("virtual_thread_local")?;
        if self.growth_factor == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("growth_factor must be positive"));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let options: RecorderOptions = serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid recorder options")
                .with_source(err)
        })?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind).with_path(path).with_source(err)
        })?;
        Self::from_json_str(&text).map_err(|err| err.with_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::{RecorderOptions, SpaceOptions};
    use crate::core::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        RecorderOptions::default().validate().expect("defaults");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let options = RecorderOptions::from_json_str(
            r#"{"thread_local": {"buffer_size": 64, "max_buffer_size": 4096}, "growth_factor": 3}"#,
        )
        .expect("parse");
        assert_eq!(options.thread_local.buffer_size, 64);
        assert_eq!(options.thread_local.cache_count, SpaceOptions::default().cache_count);
        assert_eq!(options.global, SpaceOptions::global());
        assert_eq!(options.growth_factor, 3);
    }

    #[test]
    fn invalid_values_are_usage_errors() {
        let err = RecorderOptions::from_json_str(r#"{"growth_factor": 0}"#).expect_err("zero");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = RecorderOptions::from_json_str(r#"{"global": {"buffer_size": 0}}"#)
            .expect_err("zero size");
        assert_eq!(err.kind(), ErrorKind::Usage);

        let err = RecorderOptions::from_json_str(r#"{"bogus": 1}"#).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recorder.json");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(br#"{"virtual_thread_local": {"buffer_size": 256, "cache_count": 0}}"#)
            .expect("write");
        let options = RecorderOptions::from_json_file(&path).expect("load");
        assert_eq!(options.virtual_thread_local.buffer_size, 256);
        assert_eq!(options.virtual_thread_local.cache_count, 0);

        let missing = RecorderOptions::from_json_file(dir.path().join("nope.json"))
            .expect_err("missing");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }
}
