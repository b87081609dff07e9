//! End-to-end scenarios driven over loopback TCP against a running server,
//! rather than unit-testing its pieces in isolation.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use imcs::admin::init_service;
use imcs::session::handle_connection;

/// Boot a server against a fresh temp data dir on an ephemeral port, and
/// return its address plus the admin password used to provision it.
async fn spawn_server() -> (std::net::SocketAddr, tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let admin_password = "supersecret".to_string();

    let server = init_service(dir.path(), 0, &admin_password).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let server = server.clone();
            let client_id = server.next_client_id();
            tokio::spawn(async move {
                handle_connection(server, stream, client_id).await;
            });
        }
    });

    (addr, dir, admin_password)
}

struct Client {
    read: BufReader<tokio::net::tcp::OwnedReadHalf>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut client = Client {
            read: BufReader::new(read),
            write,
        };
        let banner = client.read_line().await;
        assert!(banner.starts_with("100 "), "unexpected banner: {banner:?}");
        client
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.read.read_line(&mut line))
            .await
            .expect("timed out waiting for a reply")
            .unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }
}

#[tokio::test]
async fn register_then_relogin_succeeds() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;

    client.send("register alice secret").await;
    assert_eq!(client.read_line().await, "202 hello new user alice");

    let mut second = Client::connect(addr).await;
    second.send("me alice secret").await;
    assert_eq!(second.read_line().await, "201 hello alice");

    second.send("me alice wrongpassword").await;
    assert_eq!(second.read_line().await, "401 wrong password");

    let mut third = Client::connect(addr).await;
    third.send("me ghost secret").await;
    assert_eq!(third.read_line().await, "400 no such user");
}

#[tokio::test]
async fn offer_and_accept_runs_a_game_and_updates_ratings() {
    let (addr, _dir, _admin_pw) = spawn_server().await;

    let mut white = Client::connect(addr).await;
    white.send("register alice secret").await;
    assert_eq!(white.read_line().await, "202 hello new user alice");

    let mut black = Client::connect(addr).await;
    black.send("register bob secret").await;
    assert_eq!(black.read_line().await, "202 hello new user bob");

    white.send("offer W").await;
    let offer_reply = white.read_line().await;
    assert!(offer_reply.starts_with("101 game "), "unexpected reply: {offer_reply}");
    let game_id: u64 = offer_reply.split_whitespace().nth(2).unwrap().parse().unwrap();

    black.send(&format!("accept {game_id}")).await;

    assert_eq!(black.read_line().await, "103 accepting offer");
    assert_eq!(white.read_line().await, "102 received acceptance");

    // both sides are now inside the NumberGuessDriver protocol
    assert_eq!(white.read_line().await, "GUESS?");
    white.send("50").await;
    assert_eq!(black.read_line().await, "GUESS?");
    black.send("0").await;

    let mut ratings_conn = Client::connect(addr).await;
    ratings_conn.send("ratings").await;
    assert_eq!(ratings_conn.read_line().await, "212 ratings follow");
    let mut saw_change = false;
    loop {
        let line = ratings_conn.read_line().await;
        if line == "." {
            break;
        }
        if line.starts_with(" alice") && !line.contains("1200") {
            saw_change = true;
        }
    }
    assert!(saw_change, "alice's rating should have moved off the base rating");
}

#[tokio::test]
async fn accept_on_unknown_game_id_returns_error_and_keeps_connection_alive() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;
    client.send("register carol secret").await;
    assert_eq!(client.read_line().await, "202 hello new user carol");

    client.send("accept 999999").await;
    assert_eq!(client.read_line().await, "408 no such offer");

    // connection should still be usable afterwards
    client.send("list").await;
    assert_eq!(client.read_line().await, "211 listing follows");
    assert_eq!(client.read_line().await, ".");
}

#[tokio::test]
async fn accept_rejects_malformed_game_ids() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;
    client.send("register frank secret").await;
    assert_eq!(client.read_line().await, "202 hello new user frank");

    client.send("accept notanumber").await;
    assert_eq!(client.read_line().await, "407 malformed game id");

    client.send("accept 123456789").await;
    assert_eq!(client.read_line().await, "407 malformed game id");
}

#[tokio::test]
async fn clean_withdraws_an_offer_and_is_idempotent() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;
    client.send("register dave secret").await;
    assert_eq!(client.read_line().await, "202 hello new user dave");

    client.send("offer B").await;
    assert!(client.read_line().await.starts_with("101 game "));

    client.send("clean").await;
    assert_eq!(client.read_line().await, "204 1 games cleaned");

    client.send("list").await;
    assert_eq!(client.read_line().await, "211 listing follows");
    assert_eq!(client.read_line().await, ".");

    // a second clean with nothing left posted reports zero, not an error
    client.send("clean").await;
    assert_eq!(client.read_line().await, "204 0 games cleaned");
}

#[tokio::test]
async fn quit_while_offering_withdraws_the_offer() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut offerer = Client::connect(addr).await;
    offerer.send("register heidi secret").await;
    assert_eq!(offerer.read_line().await, "202 hello new user heidi");

    offerer.send("offer W").await;
    let reply = offerer.read_line().await;
    assert!(reply.starts_with("101 game "));
    let game_id: u64 = reply.split_whitespace().nth(2).unwrap().parse().unwrap();

    offerer.send("quit").await;
    assert_eq!(offerer.read_line().await, "200 Goodbye");

    let mut other = Client::connect(addr).await;
    other.send("register ivan secret").await;
    assert_eq!(other.read_line().await, "202 hello new user ivan");
    other.send(&format!("accept {game_id}")).await;
    assert_eq!(other.read_line().await, "408 no such offer");
}

#[tokio::test]
async fn quit_replies_goodbye() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;
    client.send("quit").await;
    assert_eq!(client.read_line().await, "200 Goodbye");
}

#[tokio::test]
async fn non_admin_stop_is_rejected() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;
    client.send("register eve secret").await;
    assert_eq!(client.read_line().await, "202 hello new user eve");

    client.send("stop").await;
    assert_eq!(client.read_line().await, "502 admin only");

    // server should still be responsive
    client.send("list").await;
    assert_eq!(client.read_line().await, "211 listing follows");
}

#[tokio::test]
async fn stop_requires_a_named_session() {
    let (addr, _dir, _admin_pw) = spawn_server().await;
    let mut client = Client::connect(addr).await;
    client.send("stop").await;
    assert_eq!(client.read_line().await, "406 not logged in");
}

// Admin `stop` itself is not exercised end-to-end here: its success path
// terminates the whole process, which would take the test binary down with
// it. `state::tests::drain_posts_for_shutdown_*` covers the draining
// behavior that `stop` relies on instead.
