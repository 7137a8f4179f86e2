use super::messages::ReaperMessage;
use super::Reaper;
use chrono::Utc;
use futures::StreamExt;
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::wrappers::IntervalStream;

pub struct ReaperActor {
    inbox: mpsc::Receiver<ReaperMessage>,
    reaper: Reaper,
}

impl ReaperActor {
    pub fn spawn(inbox: mpsc::Receiver<ReaperMessage>, reaper: Reaper) {
        let actor = Self { inbox, reaper };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::ReaperMessage::*;
        let mut ticks = IntervalStream::new(tokio::time::interval(self.reaper.settings.interval));
        loop {
            select! {
                maybe_msg = self.inbox.recv() => match maybe_msg {
                    Some(Sweep { response }) => {
                        let _ = response.send(self.reaper.sweep(Utc::now()).await);
                    }
                    Some(Stop) | None => return,
                },
                Some(_) = ticks.next() => {
                    if let Err(err) = self.reaper.sweep(Utc::now()).await {
                        tracing::error!(error = %err, "stall sweep failed");
                    }
                }
            }
        }
    }
}
