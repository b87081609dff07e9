//! The persistence store: a versioned directory holding `VERSION`,
//! `private/GAMEID`, `private/passwd`, and `log/<gameId>` transcripts.
//!
//! A small typed API in front of plain files, not a database connection.
//! Callers hold the state guard (see `state::Server`) for the short
//! synchronous calls into this module.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::error::BrokerError;
use crate::rating::BASE_RATING;

pub const CURRENT_VERSION: &str = "2.2";

#[derive(Clone, Debug)]
pub struct PlayerRecord {
    pub password: String,
    pub rating: i32,
}

pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Store> {
        let store = Store { root: root.into() };
        store.migrate()?;
        Ok(store)
    }

    fn private_dir(&self) -> PathBuf {
        self.root.join("private")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn log_path(&self, game_id: u64) -> PathBuf {
        self.log_dir().join(game_id.to_string())
    }

    fn version_path(&self) -> PathBuf {
        self.root.join("VERSION")
    }

    fn passwd_path(&self) -> PathBuf {
        self.private_dir().join("passwd")
    }

    fn gameid_path(&self) -> PathBuf {
        self.private_dir().join("GAMEID")
    }

    fn migrate(&self) -> Result<()> {
        fs::create_dir_all(self.private_dir())
            .with_context(|| format!("creating {:?}", self.private_dir()))?;
        fs::create_dir_all(self.log_dir())
            .with_context(|| format!("creating {:?}", self.log_dir()))?;

        let version_path = self.version_path();
        if !version_path.exists() {
            // bootstrap from nothing
            if !self.passwd_path().exists() {
                fs::write(self.passwd_path(), "")?;
            }
            if !self.gameid_path().exists() {
                fs::write(self.gameid_path(), "1\n")?;
            }
            fs::write(&version_path, format!("{CURRENT_VERSION}\n"))?;
            return Ok(());
        }

        let on_disk = fs::read_to_string(&version_path)
            .with_context(|| format!("reading {version_path:?}"))?;
        let on_disk = on_disk.trim();

        if on_disk == CURRENT_VERSION {
            return Ok(());
        }

        match on_disk {
            "2.0" | "2.1" => {
                self.migrate_legacy_passwd()
                    .context("migrating legacy 2-column passwd file")?;
                fs::write(&version_path, format!("{CURRENT_VERSION}\n"))?;
                Ok(())
            }
            other => Err(BrokerError::UnknownVersion(other.to_string()).into()),
        }
    }

    // Versions 2.0/2.1 stored `name password` with no rating column.
    fn migrate_legacy_passwd(&self) -> Result<()> {
        let path = self.passwd_path();
        let contents = fs::read_to_string(&path).with_context(|| format!("reading {path:?}"))?;

        let mut players = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let name = parts.next().context("legacy passwd row missing name")?;
            let password = parts.next().context("legacy passwd row missing password")?;
            players.insert(
                name.to_string(),
                PlayerRecord {
                    password: password.to_string(),
                    rating: BASE_RATING,
                },
            );
        }

        self.save_players(&players)
    }

    pub fn load_players(&self) -> Result<HashMap<String, PlayerRecord>> {
        let path = self.passwd_path();
        let contents = fs::read_to_string(&path).with_context(|| format!("reading {path:?}"))?;

        let mut players = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let name = parts
                .next()
                .with_context(|| format!("malformed passwd row: {line:?}"))?;
            let password = parts
                .next()
                .with_context(|| format!("malformed passwd row: {line:?}"))?;
            let rating: i32 = parts
                .next()
                .with_context(|| format!("malformed passwd row: {line:?}"))?
                .parse()
                .with_context(|| format!("malformed rating in passwd row: {line:?}"))?;
            players.insert(
                name.to_string(),
                PlayerRecord {
                    password: password.to_string(),
                    rating,
                },
            );
        }
        Ok(players)
    }

    // Writes to passwd.tmp and renames it over passwd in one syscall, so a
    // crash never leaves passwd missing.
    pub fn save_players(&self, players: &HashMap<String, PlayerRecord>) -> Result<()> {
        let mut names: Vec<&String> = players.keys().collect();
        names.sort();

        let mut contents = String::new();
        for name in names {
            let record = &players[name];
            contents.push_str(name);
            contents.push(' ');
            contents.push_str(&record.password);
            contents.push(' ');
            contents.push_str(&record.rating.to_string());
            contents.push('\n');
        }

        let tmp_path = self.passwd_path().with_extension("tmp");
        fs::write(&tmp_path, contents).with_context(|| format!("writing {tmp_path:?}"))?;
        fs::rename(&tmp_path, self.passwd_path())
            .with_context(|| "renaming passwd.tmp over passwd".to_string())?;
        Ok(())
    }

    pub fn load_next_game_id(&self) -> Result<u64> {
        let path = self.gameid_path();
        let contents = fs::read_to_string(&path).with_context(|| format!("reading {path:?}"))?;
        contents
            .trim()
            .parse()
            .with_context(|| format!("malformed GAMEID contents: {contents:?}"))
    }

    pub fn save_next_game_id(&self, next_game_id: u64) -> Result<()> {
        let path = self.gameid_path();
        fs::write(&path, format!("{next_game_id}\n")).with_context(|| format!("writing {path:?}"))
    }
}
