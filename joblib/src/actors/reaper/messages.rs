use crate::store;
use crate::types::Jid;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum ReaperMessage {
    Sweep {
        response: oneshot::Sender<store::Result<Vec<Jid>>>,
    },
    Stop,
}
