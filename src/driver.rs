//! The broker hands both players' streams to a `GameDriver` and waits for a
//! final score. `async-trait` covers this one seam since `dyn GameDriver`
//! needs to be object-safe and native async-fn-in-trait isn't.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::log_sink;

pub struct PlayerEndpoint {
    pub name: String,
    pub stream: TcpStream,
    pub time_budget_ms: u64,
}

/// Returns the result from white's perspective: `1` white wins, `-1` black
/// wins, `0` draw. Any other value is forwarded verbatim into
/// `rating::update_rating` rather than clamped.
#[async_trait]
pub trait GameDriver: Send + Sync {
    async fn play(&self, white: &mut PlayerEndpoint, black: &mut PlayerEndpoint) -> Result<i8>;
}

/// Each side has one chance to send `GUESS <n>`, closer to a hidden target
/// of 50 wins. Lets the crate run end-to-end without a real game plugged in.
pub struct NumberGuessDriver;

const TARGET: i64 = 50;

#[async_trait]
impl GameDriver for NumberGuessDriver {
    async fn play(&self, white: &mut PlayerEndpoint, black: &mut PlayerEndpoint) -> Result<i8> {
        let white_guess = read_guess(white).await;
        let black_guess = read_guess(black).await;

        log_sink::log(&format!(
            "white ({}) guessed {:?}, black ({}) guessed {:?}, target was {TARGET}",
            white.name, white_guess, black.name, black_guess
        ));

        let score = match (white_guess, black_guess) {
            (Some(w), Some(b)) => {
                let white_distance = (w - TARGET).abs();
                let black_distance = (b - TARGET).abs();
                match white_distance.cmp(&black_distance) {
                    std::cmp::Ordering::Less => 1,
                    std::cmp::Ordering::Greater => -1,
                    std::cmp::Ordering::Equal => 0,
                }
            }
            (Some(_), None) => 1,
            (None, Some(_)) => -1,
            (None, None) => 0,
        };
        Ok(score)
    }
}

async fn read_guess(side: &mut PlayerEndpoint) -> Option<i64> {
    let prompt = b"GUESS?\n";
    if side.stream.write_all(prompt).await.is_err() {
        return None;
    }

    let budget = Duration::from_millis(side.time_budget_ms);
    let mut reader = BufReader::new(&mut side.stream);
    let mut line = String::new();
    match timeout(budget, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => line.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn closer_guess_wins() {
        let (white_broker, mut white_client) = connected_pair().await;
        let (black_broker, mut black_client) = connected_pair().await;

        let mut white = PlayerEndpoint {
            name: "white".into(),
            stream: white_broker,
            time_budget_ms: 1000,
        };
        let mut black = PlayerEndpoint {
            name: "black".into(),
            stream: black_broker,
            time_budget_ms: 1000,
        };

        let driver_fut = NumberGuessDriver.play(&mut white, &mut black);
        let clients_fut = async {
            let mut buf = [0u8; 64];
            white_client.read(&mut buf).await.unwrap();
            white_client.write_all(b"49\n").await.unwrap();
            black_client.read(&mut buf).await.unwrap();
            black_client.write_all(b"10\n").await.unwrap();
        };

        let (score, _) = tokio::join!(driver_fut, clients_fut);
        assert_eq!(score.unwrap(), 1);
    }

    #[tokio::test]
    async fn silent_side_loses() {
        let (white_broker, mut white_client) = connected_pair().await;
        let (black_broker, _black_client) = connected_pair().await;

        let mut white = PlayerEndpoint {
            name: "white".into(),
            stream: white_broker,
            time_budget_ms: 200,
        };
        let mut black = PlayerEndpoint {
            name: "black".into(),
            stream: black_broker,
            time_budget_ms: 200,
        };

        let driver_fut = NumberGuessDriver.play(&mut white, &mut black);
        let client_fut = async {
            let mut buf = [0u8; 64];
            white_client.read(&mut buf).await.unwrap();
            white_client.write_all(b"50\n").await.unwrap();
        };

        let (score, _) = tokio::join!(driver_fut, client_fut);
        assert_eq!(score.unwrap(), 1);
    }
}
