//! Executes remote API calls off the catalog thread.
//!
//! Each request runs on its own thread so completions can arrive in any order.
//! The worker holds no catalog state; it only turns `Request` messages into
//! `Completed` messages.

use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::backends::{execute, TracksBackend};
use crate::protocol::{ApiCall, Message, RemoteMessage, RequestId};

pub struct RemoteWorker {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    backend: Arc<dyn TracksBackend>,
}

impl RemoteWorker {
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        backend: Arc<dyn TracksBackend>,
    ) -> Self {
        Self {
            bus_consumer,
            bus_producer,
            backend,
        }
    }

    fn spawn_request(&self, request_id: RequestId, call: ApiCall) {
        let backend = Arc::clone(&self.backend);
        let bus_producer = self.bus_producer.clone();
        thread::spawn(move || {
            debug!("RemoteWorker: request {} started: {:?}", request_id, call);
            let outcome = execute(backend.as_ref(), &call);
            if let Err(err) = &outcome {
                warn!("RemoteWorker: request {} failed: {}", request_id, err);
            }
            let _ = bus_producer.send(Message::Remote(RemoteMessage::Completed {
                request_id,
                outcome,
            }));
        });
    }

    pub fn run(&mut self) {
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::Remote(RemoteMessage::Request { request_id, call })) => {
                    self.spawn_request(request_id, call);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "RemoteWorker lagged on control bus, skipped {} message(s)",
                        skipped
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
