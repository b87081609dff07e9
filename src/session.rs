//! The per-connection command session: one task per client, reading line
//! commands and dispatching them against the shared `Server`.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::driver::PlayerEndpoint;
use crate::log_sink;
use crate::protocol::{
    format_in_progress_row, format_offer_row, format_ratings_row, Color, PROTOCOL_VERSION,
};
use crate::rendezvous::RendezvousMessage;
use crate::state::{AuthResult, ChangePasswordError, ListRow, RegisterError, Server};

const RATINGS_TOP_N: usize = 10;

/// A half-split socket plus line buffering, kept reunitable so ownership
/// can be handed off to the game driver once a pairing completes.
pub struct Conn {
    read: BufReader<OwnedReadHalf>,
    write: OwnedWriteHalf,
}

impl Conn {
    fn new(stream: TcpStream) -> Conn {
        let (read, write) = stream.into_split();
        Conn {
            read: BufReader::new(read),
            write,
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.write.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.write.write_all(b"\n").await?;
        }
        Ok(())
    }

    /// `Ok(None)` means clean EOF.
    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.read.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn into_stream(self) -> TcpStream {
        self.read
            .into_inner()
            .reunite(self.write)
            .expect("read/write halves always came from the same stream")
    }
}

/// Whether a command handler consumed the connection (handed its socket off
/// elsewhere) or is returning it for the next loop iteration. Only
/// `offer`/`accept` need this: every other handler keeps `&mut Conn`.
enum ConnOutcome {
    Ended,
    Continue(Conn),
}

pub async fn handle_connection(server: Arc<Server>, stream: TcpStream, client_id: u64) {
    let mut conn = Conn::new(stream);
    if conn
        .write_line(&format!("100 imcs {PROTOCOL_VERSION}"))
        .await
        .is_err()
    {
        return;
    }

    if let Err(e) = run(server, conn, client_id).await {
        log::debug!("session {client_id} ended with error: {e:#}");
    }
}

async fn run(server: Arc<Server>, mut conn: Conn, client_id: u64) -> Result<()> {
    let mut logged_in: Option<String> = None;

    loop {
        let line = match conn.read_line().await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(c) => c,
            None => continue,
        };
        let args: Vec<&str> = parts.collect();

        match command {
            "me" => handle_me(&server, &mut conn, &mut logged_in, &args).await?,
            "register" => handle_register(&server, &mut conn, &mut logged_in, &args).await?,
            "password" => handle_password(&server, &mut conn, &logged_in, &args).await?,
            "list" => handle_list(&server, &mut conn).await?,
            "ratings" => handle_ratings(&server, &mut conn, &logged_in).await?,
            "help" => handle_help(&mut conn).await?,
            "clean" => handle_clean(&server, &mut conn, &logged_in, client_id).await?,
            "stop" => handle_stop(&server, &mut conn, &logged_in).await?,
            "offer" => match handle_offer(server.clone(), conn, client_id, &logged_in, &args).await? {
                ConnOutcome::Ended => return Ok(()),
                ConnOutcome::Continue(c) => conn = c,
            },
            "accept" => match handle_accept(server.clone(), conn, client_id, &logged_in, &args).await? {
                ConnOutcome::Ended => return Ok(()),
                ConnOutcome::Continue(c) => conn = c,
            },
            "quit" => {
                conn.write_line("200 Goodbye").await?;
                return Ok(());
            }
            _ => {
                conn.write_line("501 unknown command").await?;
            }
        }
    }
}

async fn handle_me(
    server: &Server,
    conn: &mut Conn,
    logged_in: &mut Option<String>,
    args: &[&str],
) -> Result<()> {
    let (name, password) = match args {
        [name, password] => (*name, *password),
        _ => {
            conn.write_line("501 unknown command").await?;
            return Ok(());
        }
    };

    match server.authenticate(name, password) {
        AuthResult::Ok { .. } => {
            *logged_in = Some(name.to_string());
            conn.write_line(&format!("201 hello {name}")).await?;
        }
        AuthResult::UnknownName => conn.write_line("400 no such user").await?,
        AuthResult::WrongPassword => conn.write_line("401 wrong password").await?,
    }
    Ok(())
}

async fn handle_register(
    server: &Server,
    conn: &mut Conn,
    logged_in: &mut Option<String>,
    args: &[&str],
) -> Result<()> {
    let (name, password) = match args {
        [name, password] => (*name, *password),
        _ => {
            conn.write_line("501 unknown command").await?;
            return Ok(());
        }
    };

    match server.register(name, password)? {
        Ok(()) => {
            *logged_in = Some(name.to_string());
            conn.write_line(&format!("202 hello new user {name}")).await?;
        }
        Err(RegisterError::NameTaken) => conn.write_line("402 user already exists").await?,
    }
    Ok(())
}

async fn handle_password(
    server: &Server,
    conn: &mut Conn,
    logged_in: &Option<String>,
    args: &[&str],
) -> Result<()> {
    let new_password = match args {
        [new_password] => *new_password,
        _ => {
            conn.write_line("501 unknown command").await?;
            return Ok(());
        }
    };

    match server.change_password(logged_in.as_deref(), new_password)? {
        Ok(()) => conn.write_line("203 password changed").await?,
        Err(ChangePasswordError::NotLoggedIn) => conn.write_line("403 not logged in").await?,
        Err(ChangePasswordError::RecordMissing) => {
            conn.write_line("500 authenticated user vanished").await?
        }
    }
    Ok(())
}

async fn handle_list(server: &Server, conn: &mut Conn) -> Result<()> {
    conn.write_line("211 listing follows").await?;
    for row in server.list_rows() {
        let rendered = match row {
            ListRow::Offer { game_id, owner, color, rating } => {
                format_offer_row(game_id, &owner, color, rating)
            }
            ListRow::InProgress {
                game_id,
                white,
                black,
                white_rating,
                black_rating,
            } => format_in_progress_row(game_id, &white, &black, white_rating, black_rating),
        };
        conn.write_line(&rendered).await?;
    }
    conn.write_line(".").await
}

/// `212`, top 10 by descending rating, plus the caller's own row if it's
/// named and has a record but fell outside the top 10.
async fn handle_ratings(server: &Server, conn: &mut Conn, logged_in: &Option<String>) -> Result<()> {
    conn.write_line("212 ratings follow").await?;
    let rows = server.ratings_rows();
    let top: Vec<&(String, i32)> = rows.iter().take(RATINGS_TOP_N).collect();
    for (name, rating) in &top {
        conn.write_line(&format_ratings_row(name, *rating)).await?;
    }
    if let Some(caller) = logged_in {
        let already_shown = top.iter().any(|(name, _)| name == caller);
        if !already_shown {
            if let Some((name, rating)) = rows.iter().find(|(name, _)| name == caller) {
                conn.write_line(&format_ratings_row(name, *rating)).await?;
            }
        }
    }
    conn.write_line(".").await
}

async fn handle_help(conn: &mut Conn) -> Result<()> {
    conn.write_line("210 help follows").await?;
    for line in [
        " me <name> <password>",
        " register <name> <password>",
        " password <new-password>",
        " offer <W|B>",
        " accept <game-id>",
        " clean",
        " list",
        " ratings",
        " stop",
        " quit",
    ] {
        conn.write_line(line).await?;
    }
    conn.write_line(".").await
}

async fn handle_clean(
    server: &Server,
    conn: &mut Conn,
    logged_in: &Option<String>,
    client_id: u64,
) -> Result<()> {
    if logged_in.is_none() {
        return conn.write_line("406 not logged in").await;
    }
    let count = server.cancel_offers_owned_by(client_id);
    conn.write_line(&format!("204 {count} games cleaned")).await
}

async fn handle_stop(server: &Server, conn: &mut Conn, logged_in: &Option<String>) -> Result<()> {
    match logged_in.as_deref() {
        None => return conn.write_line("406 not logged in").await,
        Some(name) if name != "admin" => return conn.write_line("502 admin only").await,
        Some(_) => {}
    }

    conn.write_line("205 server stopping, goodbye").await?;
    let done_rxs = server.drain_posts_for_shutdown();
    for done_rx in done_rxs {
        let _ = done_rx.await;
    }
    std::process::exit(0);
}

async fn handle_offer(
    server: Arc<Server>,
    mut conn: Conn,
    client_id: u64,
    logged_in: &Option<String>,
    args: &[&str],
) -> Result<ConnOutcome> {
    let owner_name = match logged_in {
        Some(name) => name.clone(),
        None => {
            conn.write_line("404 not logged in").await?;
            return Ok(ConnOutcome::Continue(conn));
        }
    };
    let owner_color = match args {
        [color] => match Color::parse(color) {
            Some(c) => c,
            None => {
                conn.write_line("405 invalid color").await?;
                return Ok(ConnOutcome::Continue(conn));
            }
        },
        _ => {
            conn.write_line("501 unknown command").await?;
            return Ok(ConnOutcome::Continue(conn));
        }
    };

    let (mailbox_tx, mailbox_rx) = oneshot::channel();
    let game_id = server.publish_offer(owner_name.clone(), client_id, owner_color, mailbox_tx)?;
    conn.write_line(&format!("101 game {game_id} waiting for offer acceptance"))
        .await?;

    match wait_for_acceptance_or_clean(&mut conn, mailbox_rx).await? {
        OfferOutcome::Accepted {
            accepter_name,
            accepter_client_id,
            accepter_stream,
        } => {
            conn.write_line("102 received acceptance").await?;
            run_game(
                server,
                game_id,
                owner_name,
                owner_color,
                conn.into_stream(),
                accepter_name,
                accepter_stream,
            )
            .await;
            let _ = accepter_client_id;
            Ok(ConnOutcome::Ended)
        }
        OfferOutcome::CleanedByClient => {
            // Only one offer can be outstanding while blocked here.
            server.cancel_offer(game_id);
            conn.write_line("204 1 games cleaned").await?;
            Ok(ConnOutcome::Continue(conn))
        }
        OfferOutcome::CancelledExternally => {
            // The offer was already removed from state by whoever sent
            // `Cancelled` (admin `stop`); the session returns to Named.
            conn.write_line("421 offer countermanded").await?;
            Ok(ConnOutcome::Continue(conn))
        }
        OfferOutcome::Quit => {
            server.cancel_offer(game_id);
            conn.write_line("200 Goodbye").await?;
            Ok(ConnOutcome::Ended)
        }
        OfferOutcome::Disconnected => {
            server.cancel_offer(game_id);
            Ok(ConnOutcome::Ended)
        }
    }
}

enum OfferOutcome {
    Accepted {
        accepter_name: String,
        accepter_client_id: u64,
        accepter_stream: TcpStream,
    },
    CleanedByClient,
    CancelledExternally,
    Quit,
    Disconnected,
}

/// Wait on the rendezvous mailbox, but keep servicing the owner's own
/// socket so a voluntary `clean` or a disconnect can interrupt the wait.
/// The mailbox arm is biased first: once an acceptance has been delivered
/// it must win even if a `clean` raced in at the same instant, since the
/// offer has already been removed from `posts` atomically with the send.
async fn wait_for_acceptance_or_clean(
    conn: &mut Conn,
    mut mailbox_rx: oneshot::Receiver<RendezvousMessage>,
) -> Result<OfferOutcome> {
    loop {
        tokio::select! {
            biased;
            msg = &mut mailbox_rx => {
                return Ok(match msg {
                    Ok(RendezvousMessage::Accepted { accepter_name, accepter_client_id, accepter_stream }) => {
                        OfferOutcome::Accepted { accepter_name, accepter_client_id, accepter_stream }
                    }
                    Ok(RendezvousMessage::Cancelled) => OfferOutcome::CancelledExternally,
                    Err(_) => OfferOutcome::Disconnected,
                });
            }
            line = conn.read_line() => {
                match line? {
                    Some(text) if text.trim() == "clean" => return Ok(OfferOutcome::CleanedByClient),
                    Some(text) if text.trim() == "quit" => return Ok(OfferOutcome::Quit),
                    Some(_) => {
                        conn.write_line("501 unknown command").await?;
                    }
                    None => return Ok(OfferOutcome::Disconnected),
                }
            }
        }
    }
}

/// Replies `103 accepting offer` before handing this connection's socket
/// into the offer's mailbox, so the accepter always sees its own
/// acknowledgement first. If the offerer has already given up by the time
/// the mailbox send happens, that's reported with the internal-error code.
async fn handle_accept(
    server: Arc<Server>,
    mut conn: Conn,
    client_id: u64,
    logged_in: &Option<String>,
    args: &[&str],
) -> Result<ConnOutcome> {
    let accepter_name = match logged_in {
        Some(name) => name.clone(),
        None => {
            conn.write_line("406 not logged in").await?;
            return Ok(ConnOutcome::Continue(conn));
        }
    };
    let game_id = match args {
        [game_id] => match crate::protocol::parse_game_id(game_id) {
            Some(id) => id,
            None => {
                conn.write_line("407 malformed game id").await?;
                return Ok(ConnOutcome::Continue(conn));
            }
        },
        _ => {
            conn.write_line("501 unknown command").await?;
            return Ok(ConnOutcome::Continue(conn));
        }
    };

    let offer = match server.take_offer_for_accept(game_id) {
        Some(offer) => offer,
        None => {
            conn.write_line("408 no such offer").await?;
            return Ok(ConnOutcome::Continue(conn));
        }
    };

    conn.write_line("103 accepting offer").await?;
    let accepter_stream = conn.into_stream();
    match offer.mailbox.send(RendezvousMessage::Accepted {
        accepter_name,
        accepter_client_id: client_id,
        accepter_stream,
    }) {
        Ok(()) => Ok(ConnOutcome::Ended),
        Err(RendezvousMessage::Accepted { accepter_stream, .. }) => {
            let mut conn = Conn::new(accepter_stream);
            conn.write_line("499 internal error").await?;
            Ok(ConnOutcome::Continue(conn))
        }
        Err(RendezvousMessage::Cancelled) => unreachable!("we only ever send Accepted here"),
    }
}

/// Runs on the task that held the offer, regardless of which side is white
/// or black.
async fn run_game(
    server: Arc<Server>,
    game_id: u64,
    owner_name: String,
    owner_color: Color,
    owner_stream: TcpStream,
    accepter_name: String,
    accepter_stream: TcpStream,
) {
    let (white_name, white_stream, black_name, black_stream) = match owner_color {
        Color::White => (owner_name.clone(), owner_stream, accepter_name.clone(), accepter_stream),
        Color::Black => (accepter_name.clone(), accepter_stream, owner_name.clone(), owner_stream),
    };

    let (done_tx, done_rx) = oneshot::channel();
    server.start_game(game_id, white_name.clone(), black_name.clone(), done_rx);

    let log_path = server.log_path(game_id);
    let outcome = log_sink::with_log_file(&log_path, async {
        log_sink::log(&format!("game {game_id}: {white_name} (W) vs {black_name} (B)"));

        let mut white = PlayerEndpoint {
            name: white_name.clone(),
            stream: white_stream,
            time_budget_ms: crate::protocol::GAME_CLOCK_MS,
        };
        let mut black = PlayerEndpoint {
            name: black_name.clone(),
            stream: black_stream,
            time_budget_ms: crate::protocol::GAME_CLOCK_MS,
        };

        let result = server.driver().play(&mut white, &mut black).await;

        (result, white.stream, black.stream)
    })
    .await;

    match outcome {
        Ok((Ok(score), mut white_stream, mut black_stream)) => {
            log_sink::log(&format!("game {game_id} finished, white score {score}"));
            if let Err(e) = server.apply_result(&white_name, &black_name, score as i32) {
                log::error!("failed to persist rating update for game {game_id}: {e:#}");
            }
            let _ = white_stream.shutdown().await;
            let _ = black_stream.shutdown().await;
        }
        Ok((Err(e), mut white_stream, mut black_stream)) => {
            log::warn!("game {game_id} driver error: {e:#}");
            let _ = white_stream.write_all(b"420 fatal IO error: exiting\n").await;
            let _ = black_stream.write_all(b"420 fatal IO error: exiting\n").await;
            let _ = white_stream.shutdown().await;
            let _ = black_stream.shutdown().await;
        }
        Err(e) => {
            log::error!("failed to open transcript for game {game_id}: {e:#}");
        }
    }

    server.finish_game(game_id);
    let _ = done_tx.send(());
}
