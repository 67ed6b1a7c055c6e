use std::path::PathBuf;

use crate::Result;

pub const DEFAULT_DATABASE_FILENAME: &str = "logic.db";

/// Prefix of the environment settings read by [`Config::from_env`].
/// `LOGICDB_PATH` names the database file; `:memory:` selects an in-memory
/// database.
pub const ENV_PREFIX: &str = "LOGICDB";

const PATH_KEY: &str = "path";
const MEMORY_PATH: &str = ":memory:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub location: StoreLocation,
}

impl Default for Config {
    fn default() -> Self {
        Self::file(DEFAULT_DATABASE_FILENAME)
    }
}

impl Config {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::Memory,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_environment(::config::Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(environment: ::config::Environment) -> Result<Self> {
        let settings = ::config::Config::builder()
            .set_default(PATH_KEY, DEFAULT_DATABASE_FILENAME)?
            .add_source(environment)
            .build()?;
        Ok(Self::from_path_setting(&settings.get_string(PATH_KEY)?))
    }

    fn from_path_setting(path: &str) -> Self {
        match path.trim() {
            "" => Self::default(),
            MEMORY_PATH => Self::in_memory(),
            path => Self::file(path),
        }
    }
}
