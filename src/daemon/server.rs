//! Connection handling.
//!
//! The acceptor spawns one handler thread per inbound connection. Mutation
//! requests call the shared engine directly - serialization lives in the
//! store's compare-and-commit, so concurrent applies race safely instead of
//! queueing behind a single state thread. A subscribe request upgrades its
//! connection to a streaming pump and never returns to the request loop.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::core::{BatchId, ItineraryId};
use crate::daemon::auth::{AuthGate, RequestClass};
use crate::daemon::broadcast::{BusError, EventBus, Subscription};
use crate::daemon::ipc::{
    self, Request, RequestEnvelope, Response, ResponsePayload, codes,
};
use crate::daemon::stream::{self, ConnectionPhase};
use crate::engine::apply::{ChangeEngine, EngineError};
use crate::engine::store::StoreError;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct ServerState {
    engine: Arc<ChangeEngine>,
    bus: Arc<EventBus>,
    gate: AuthGate,
    shutdown_flag: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl ServerState {
    pub fn new(engine: Arc<ChangeEngine>, bus: Arc<EventBus>, gate: AuthGate) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
        Arc::new(Self {
            engine,
            bus,
            gate,
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        })
    }

    pub fn engine(&self) -> &Arc<ChangeEngine> {
        &self.engine
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    /// Stop accepting and wake every streaming pump. Dropping the sender
    /// disconnects all receiver clones at once.
    pub fn trigger_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Ok(mut guard) = self.shutdown_tx.lock() {
            guard.take();
        }
    }
}

/// Accept loop. Returns once shutdown is triggered.
pub fn run_server(listener: UnixListener, state: Arc<ServerState>) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    info!("accepting connections");
    loop {
        if state.shutdown_requested() {
            info!("acceptor stopping");
            return Ok(());
        }
        match listener.accept() {
            Ok((conn, _addr)) => {
                conn.set_nonblocking(false)?;
                let state = Arc::clone(&state);
                std::thread::spawn(move || handle_client(conn, state));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                error!(error = %err, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

enum Outcome {
    /// Write the response, keep serving this connection.
    Respond(Response),
    /// Write the response, then close the connection.
    Close(Response),
    /// Write the ack, then become a streaming pump until disconnect.
    Stream(Box<Subscription>, Response),
    /// Write the response, then stop the daemon.
    Shutdown(Response),
}

fn handle_client(conn: UnixStream, state: Arc<ServerState>) {
    let reader = match conn.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            warn!(error = %err, "failed to clone connection");
            return;
        }
    };
    let mut writer = conn;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match ipc::decode_request(&line) {
            Ok(envelope) => handle_request(&state, envelope),
            Err(err) => Outcome::Respond(Response::err(codes::PARSE_ERROR, err.to_string())),
        };

        match outcome {
            Outcome::Respond(response) => {
                if write_response(&mut writer, &response).is_err() {
                    break;
                }
            }
            Outcome::Close(response) => {
                let _ = write_response(&mut writer, &response);
                break;
            }
            Outcome::Stream(subscription, ack) => {
                if write_response(&mut writer, &ack).is_err() {
                    break;
                }
                stream::pump_events(*subscription, &mut writer, &state.shutdown_rx);
                break;
            }
            Outcome::Shutdown(response) => {
                let _ = write_response(&mut writer, &response);
                state.trigger_shutdown();
                break;
            }
        }
    }
}

fn write_response(writer: &mut impl Write, response: &Response) -> std::io::Result<()> {
    let line = ipc::encode_response(response)
        .unwrap_or_else(|_| "{\"err\":{\"code\":\"internal\",\"message\":\"encode\"}}\n".into());
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

fn handle_request(state: &ServerState, envelope: RequestEnvelope) -> Outcome {
    // Classification gates which request bodies a path may carry, and which
    // credential rule runs. Subscribe rides streaming paths, everything
    // else rides standard paths.
    let class = AuthGate::classify(&envelope.path);
    let wants_stream = matches!(envelope.body, Request::Subscribe { .. });
    match (class, wants_stream) {
        (RequestClass::Streaming, false) => {
            return Outcome::Respond(Response::err(
                codes::INVALID_REQUEST,
                "streaming path only accepts subscribe",
            ));
        }
        (RequestClass::Standard, true) => {
            return Outcome::Respond(Response::err(
                codes::INVALID_REQUEST,
                "subscribe requires a streaming path",
            ));
        }
        _ => {}
    }

    let subject = match state
        .gate
        .authenticate(&envelope.path, &envelope.headers, &envelope.query)
    {
        Ok(subject) => subject,
        Err(err) => {
            // Auth failures are terminal: close so streaming clients
            // redirect to re-authentication instead of retrying.
            return Outcome::Close(Response::err(codes::AUTH_REJECTED, err.to_string()));
        }
    };

    match envelope.body {
        Request::ApplyChanges { itinerary, changes } => {
            let id = match parse_itinerary(&itinerary) {
                Ok(id) => id,
                Err(response) => return Outcome::Respond(response),
            };
            match state.engine.apply(&id, changes) {
                Ok(result) => Outcome::Respond(Response::ok(ResponsePayload::Applied(result))),
                Err(err) => Outcome::Respond(engine_error_response(&err)),
            }
        }

        Request::Undo { itinerary, batch_id } => {
            let id = match parse_itinerary(&itinerary) {
                Ok(id) => id,
                Err(response) => return Outcome::Respond(response),
            };
            let batch = match BatchId::parse(&batch_id) {
                Ok(batch) => batch,
                Err(err) => {
                    return Outcome::Respond(Response::err(
                        codes::INVALID_REQUEST,
                        err.to_string(),
                    ));
                }
            };
            match state.engine.undo(&id, batch) {
                Ok(result) => Outcome::Respond(Response::ok(ResponsePayload::Applied(result))),
                Err(err) => Outcome::Respond(engine_error_response(&err)),
            }
        }

        Request::GetItinerary { itinerary } => {
            let id = match parse_itinerary(&itinerary) {
                Ok(id) => id,
                Err(response) => return Outcome::Respond(response),
            };
            match state.engine.store().get(&id) {
                Ok(snapshot) => Outcome::Respond(Response::ok(ResponsePayload::Itinerary(
                    Box::new((*snapshot).clone()),
                ))),
                Err(err) => Outcome::Respond(store_error_response(&err)),
            }
        }

        Request::Subscribe { itinerary } => {
            let id = match parse_itinerary(&itinerary) {
                Ok(id) => id,
                Err(response) => return Outcome::Respond(response),
            };
            stream::log_phase(&id, &subject, ConnectionPhase::Authenticating);
            // The itinerary must exist before we hold a channel open for it.
            if let Err(err) = state.engine.store().get(&id) {
                return Outcome::Respond(store_error_response(&err));
            }
            match state.bus.subscribe(&id, subject.clone()) {
                Ok(subscription) => {
                    let ack = Response::ok(ResponsePayload::Subscribed {
                        itinerary: id.to_string(),
                        subject: subject.to_string(),
                    });
                    Outcome::Stream(Box::new(subscription), ack)
                }
                Err(err @ BusError::SubscriberLimitReached { .. }) => {
                    Outcome::Close(Response::err(codes::OVERLOADED, err.to_string()))
                }
                Err(err) => Outcome::Close(Response::err(codes::INTERNAL, err.to_string())),
            }
        }

        Request::Shutdown => Outcome::Shutdown(Response::ok(ResponsePayload::ShuttingDown)),
    }
}

fn parse_itinerary(raw: &str) -> Result<ItineraryId, Response> {
    ItineraryId::parse(raw)
        .map_err(|err| Response::err(codes::INVALID_REQUEST, err.to_string()))
}

fn engine_error_response(err: &EngineError) -> Response {
    match err {
        EngineError::Store(store_err) => store_error_response(store_err),
        EngineError::Conflict { .. } => Response::err(codes::CONFLICT, err.to_string()),
        EngineError::OwnerImmutable => Response::err(codes::OWNER_IMMUTABLE, err.to_string()),
        EngineError::UnknownBatch { .. } => Response::err(codes::UNKNOWN_BATCH, err.to_string()),
        EngineError::Core(_) => Response::err(codes::INVALID_REQUEST, err.to_string()),
        EngineError::Encode(_) | EngineError::LockPoisoned => {
            Response::err(codes::INTERNAL, err.to_string())
        }
    }
}

fn store_error_response(err: &StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => Response::err(codes::NOT_FOUND, err.to_string()),
        StoreError::VersionConflict { .. } => Response::err(codes::CONFLICT, err.to_string()),
        StoreError::OwnerImmutable => Response::err(codes::OWNER_IMMUTABLE, err.to_string()),
        _ => Response::err(codes::INTERNAL, err.to_string()),
    }
}
