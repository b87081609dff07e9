//! The broker's global mutable state and the exclusive guard around it: the
//! next game id, the posted offers and in-progress games, and the
//! registered players. The guard is a real `std::sync::Mutex`, never a
//! `tokio::sync::Mutex`: every critical section here is synchronous
//! bookkeeping, so a std mutex is both cheaper and a stronger guarantee
//! against accidentally holding it across an `.await` (the compiler refuses
//! to let a `MutexGuard` survive a yield point since it isn't `Send`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::driver::GameDriver;
use crate::persistence::{PlayerRecord, Store};
use crate::protocol::Color;
use crate::rating::{update_rating, BASE_RATING};
use crate::rendezvous::{MailboxTx, RendezvousMessage};

pub struct Offer {
    pub game_id: u64,
    pub owner_name: String,
    pub owner_client_id: u64,
    pub owner_color: Color,
    pub mailbox: MailboxTx,
}

// done_rx resolves once the session task owning the game finishes cleaning
// up; stop() waits on it.
pub struct InProgress {
    pub game_id: u64,
    pub white_name: String,
    pub black_name: String,
    pub done_rx: oneshot::Receiver<()>,
}

pub enum Post {
    Offer(Offer),
    InProgress(InProgress),
}

struct ServiceState {
    next_game_id: u64,
    posts: Vec<Post>,
    players: HashMap<String, PlayerRecord>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegisterError {
    #[error("that name is already taken")]
    NameTaken,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChangePasswordError {
    #[error("not logged in")]
    NotLoggedIn,
    #[error("authenticated user vanished")]
    RecordMissing,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthResult {
    Ok { rating: i32 },
    UnknownName,
    WrongPassword,
}

pub enum ListRow {
    Offer {
        game_id: u64,
        owner: String,
        color: Color,
        rating: Option<i32>,
    },
    InProgress {
        game_id: u64,
        white: String,
        black: String,
        white_rating: Option<i32>,
        black_rating: Option<i32>,
    },
}

pub struct Server {
    state: Mutex<ServiceState>,
    store: Store,
    admin_password: String,
    driver: Box<dyn GameDriver>,
    next_client_id: AtomicU64,
}

impl Server {
    pub fn new(store: Store, admin_password: String, driver: Box<dyn GameDriver>) -> Result<Arc<Server>> {
        let next_game_id = store.load_next_game_id().context("loading next game id")?;
        let mut players = store.load_players().context("loading players")?;

        // Provision (or refresh the password of) the built-in admin account
        // on every boot, preserving any rating it has already accrued.
        let admin_rating = players.get("admin").map(|r| r.rating).unwrap_or(BASE_RATING);
        players.insert(
            "admin".to_string(),
            PlayerRecord {
                password: admin_password.clone(),
                rating: admin_rating,
            },
        );
        store.save_players(&players).context("provisioning admin account")?;

        Ok(Arc::new(Server {
            state: Mutex::new(ServiceState {
                next_game_id,
                posts: Vec::new(),
                players,
            }),
            store,
            admin_password,
            driver,
            next_client_id: AtomicU64::new(1),
        }))
    }

    pub fn next_client_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn driver(&self) -> &dyn GameDriver {
        self.driver.as_ref()
    }

    pub fn log_path(&self, game_id: u64) -> PathBuf {
        self.store.log_path(game_id)
    }

    pub fn is_admin_password(&self, candidate: &str) -> bool {
        candidate == self.admin_password
    }

    pub fn authenticate(&self, name: &str, password: &str) -> AuthResult {
        let state = self.state.lock().unwrap();
        match state.players.get(name) {
            None => AuthResult::UnknownName,
            Some(record) if record.password != password => AuthResult::WrongPassword,
            Some(record) => AuthResult::Ok { rating: record.rating },
        }
    }

    pub fn rating_of(&self, name: &str) -> Option<i32> {
        let state = self.state.lock().unwrap();
        state.players.get(name).map(|r| r.rating)
    }

    pub fn register(&self, name: &str, password: &str) -> Result<Result<(), RegisterError>> {
        let mut state = self.state.lock().unwrap();
        if state.players.contains_key(name) {
            return Ok(Err(RegisterError::NameTaken));
        }
        state.players.insert(
            name.to_string(),
            PlayerRecord {
                password: password.to_string(),
                rating: BASE_RATING,
            },
        );
        self.store.save_players(&state.players)?;
        Ok(Ok(()))
    }

    pub fn change_password(
        &self,
        name: Option<&str>,
        new_password: &str,
    ) -> Result<Result<(), ChangePasswordError>> {
        let name = match name {
            Some(n) => n,
            None => return Ok(Err(ChangePasswordError::NotLoggedIn)),
        };
        let mut state = self.state.lock().unwrap();
        match state.players.get_mut(name) {
            Some(record) => record.password = new_password.to_string(),
            None => return Ok(Err(ChangePasswordError::RecordMissing)),
        }
        self.store.save_players(&state.players)?;
        Ok(Ok(()))
    }

    pub fn list_rows(&self) -> Vec<ListRow> {
        let state = self.state.lock().unwrap();
        state
            .posts
            .iter()
            .map(|post| match post {
                Post::Offer(offer) => ListRow::Offer {
                    game_id: offer.game_id,
                    owner: offer.owner_name.clone(),
                    color: offer.owner_color,
                    rating: state.players.get(&offer.owner_name).map(|r| r.rating),
                },
                Post::InProgress(game) => ListRow::InProgress {
                    game_id: game.game_id,
                    white: game.white_name.clone(),
                    black: game.black_name.clone(),
                    white_rating: state.players.get(&game.white_name).map(|r| r.rating),
                    black_rating: state.players.get(&game.black_name).map(|r| r.rating),
                },
            })
            .collect()
    }

    /// Ties break on name so the ordering is deterministic.
    pub fn ratings_rows(&self) -> Vec<(String, i32)> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<(String, i32)> =
            state.players.iter().map(|(name, r)| (name.clone(), r.rating)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    pub fn publish_offer(
        &self,
        owner_name: String,
        owner_client_id: u64,
        owner_color: Color,
        mailbox: MailboxTx,
    ) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let game_id = state.next_game_id;
        state.next_game_id += 1;
        self.store.save_next_game_id(state.next_game_id)?;

        state.posts.push(Post::Offer(Offer {
            game_id,
            owner_name,
            owner_client_id,
            owner_color,
            mailbox,
        }));
        Ok(game_id)
    }

    fn take_offer(state: &mut ServiceState, game_id: u64) -> Option<Offer> {
        let index = state.posts.iter().position(|post| match post {
            Post::Offer(offer) => offer.game_id == game_id,
            Post::InProgress(_) => false,
        })?;
        match state.posts.remove(index) {
            Post::Offer(offer) => Some(offer),
            Post::InProgress(_) => unreachable!(),
        }
    }

    // Once this returns Some, no other session can re-accept game_id, so the
    // caller can reply on its own connection and deliver Accepted outside the
    // guard.
    pub fn take_offer_for_accept(&self, game_id: u64) -> Option<Offer> {
        let mut state = self.state.lock().unwrap();
        Self::take_offer(&mut state, game_id)
    }

    pub fn cancel_offer(&self, game_id: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        match Self::take_offer(&mut state, game_id) {
            Some(offer) => {
                drop(state);
                let _ = offer.mailbox.send(RendezvousMessage::Cancelled);
                true
            }
            None => false,
        }
    }

    // Keyed by connection rather than player name: a connection, not a
    // name, owns a mailbox.
    pub fn cancel_offers_owned_by(&self, owner_client_id: u64) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for post in std::mem::take(&mut state.posts) {
            match post {
                Post::Offer(offer) if offer.owner_client_id == owner_client_id => removed.push(offer),
                other => kept.push(other),
            }
        }
        state.posts = kept;
        drop(state);

        let count = removed.len();
        for offer in removed {
            let _ = offer.mailbox.send(RendezvousMessage::Cancelled);
        }
        count
    }

    pub fn start_game(&self, game_id: u64, white_name: String, black_name: String, done_rx: oneshot::Receiver<()>) {
        let mut state = self.state.lock().unwrap();
        state.posts.push(Post::InProgress(InProgress {
            game_id,
            white_name,
            black_name,
            done_rx,
        }));
    }

    pub fn finish_game(&self, game_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.posts.retain(|post| !matches!(post, Post::InProgress(g) if g.game_id == game_id));
    }

    /// `white_score` is from white's perspective; black's score is its negation.
    pub fn apply_result(&self, white_name: &str, black_name: &str, white_score: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let white_rating = state.players.get(white_name).map(|r| r.rating).unwrap_or(BASE_RATING);
        let black_rating = state.players.get(black_name).map(|r| r.rating).unwrap_or(BASE_RATING);

        let new_white = update_rating(white_rating, black_rating, white_score);
        let new_black = update_rating(black_rating, white_rating, -white_score);

        if let Some(record) = state.players.get_mut(white_name) {
            record.rating = new_white;
        }
        if let Some(record) = state.players.get_mut(black_name) {
            record.rating = new_black;
        }
        self.store.save_players(&state.players)
    }

    pub fn drain_posts_for_shutdown(&self) -> Vec<oneshot::Receiver<()>> {
        let mut state = self.state.lock().unwrap();
        let posts = std::mem::take(&mut state.posts);
        drop(state);

        let mut done_rxs = Vec::new();
        for post in posts {
            match post {
                Post::Offer(offer) => {
                    let _ = offer.mailbox.send(RendezvousMessage::Cancelled);
                }
                Post::InProgress(game) => done_rxs.push(game.done_rx),
            }
        }
        done_rxs
    }
}
