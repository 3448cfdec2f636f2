//! `config.ini` parsing, grounded on `caf/app.py::read_config` and
//! `caflib/Remote.py`'s config-group helpers: sections `remote "NAME"`,
//! `queue "NAME"`, and `core`. `rust-ini` plays the role here that
//! `configparser` plays in the original — a crate fitting the format rather
//! than a hand-rolled parser, the same posture the teacher takes reaching
//! for a format-specific crate (`jsonc-parser`) for its own config files.

use camino::Utf8Path;
use ini::Ini;

use crate::error::CliError;

pub struct Config {
    ini: Ini,
}

pub struct RemoteSpec {
    pub name: String,
    pub host: String,
    pub path: String,
}

pub struct QueueSpec {
    pub name: String,
    pub host: String,
    pub token: String,
}

impl Config {
    pub fn load(path: &Utf8Path) -> Result<Self, CliError> {
        let ini = if path.exists() { Ini::load_from_file(path)? } else { Ini::new() };
        Ok(Self { ini })
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), CliError> {
        self.ini.write_to_file(path)?;
        Ok(())
    }

    pub fn core_get(&self, key: &str) -> Option<&str> {
        self.ini.get_from(Some("core"), key)
    }

    pub fn core_set(&mut self, key: &str, value: &str) {
        self.ini.with_section(Some("core")).set(key, value);
    }

    pub fn remotes(&self) -> Vec<RemoteSpec> {
        self.ini
            .sections()
            .filter_map(|section| {
                let section = section?;
                let name = section.strip_prefix("remote \"")?.strip_suffix('"')?;
                let properties = self.ini.section(Some(section))?;
                Some(RemoteSpec {
                    name: name.to_string(),
                    host: properties.get("host").unwrap_or_default().to_string(),
                    path: properties.get("path").unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    pub fn remote(&self, name: &str) -> Result<RemoteSpec, CliError> {
        self.remotes()
            .into_iter()
            .find(|r| r.name == name)
            .ok_or_else(|| CliError::RemoteNotFound(name.to_string()))
    }

    pub fn add_remote(&mut self, name: &str, host: &str, path: &str) {
        let section = format!("remote \"{name}\"");
        self.ini.with_section(Some(section)).set("host", host).set("path", path);
    }

    pub fn queues(&self) -> Vec<QueueSpec> {
        self.ini
            .sections()
            .filter_map(|section| {
                let section = section?;
                let name = section.strip_prefix("queue \"")?.strip_suffix('"')?;
                let properties = self.ini.section(Some(section))?;
                Some(QueueSpec {
                    name: name.to_string(),
                    host: properties.get("host").unwrap_or_default().to_string(),
                    token: properties.get("token").unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    pub fn queue(&self, name: &str) -> Result<QueueSpec, CliError> {
        self.queues().into_iter().find(|q| q.name == name).ok_or_else(|| CliError::QueueNotFound(name.to_string()))
    }

    pub fn add_queue(&mut self, name: &str, host: &str, token: &str) {
        let section = format!("queue \"{name}\"");
        self.ini.with_section(Some(section)).set("host", host).set("token", token);
    }
}
