//! One-shot mailbox that wakes an offering session with an acceptance or a
//! cancellation, backed by `tokio::sync::oneshot`.

use tokio::net::TcpStream;
use tokio::sync::oneshot;

pub enum RendezvousMessage {
    Accepted {
        accepter_name: String,
        accepter_client_id: u64,
        accepter_stream: TcpStream,
    },
    Cancelled,
}

pub type MailboxTx = oneshot::Sender<RendezvousMessage>;
pub type MailboxRx = oneshot::Receiver<RendezvousMessage>;
