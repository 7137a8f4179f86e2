use tokio::sync::oneshot;

#[derive(Debug)]
pub enum ClaimLoopMessage {
    InFlight { response: oneshot::Sender<usize> },
    Stop { response: oneshot::Sender<usize> },
}
