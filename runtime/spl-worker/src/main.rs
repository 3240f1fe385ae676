//! Out-of-process execution context: one init frame, then request frames on
//! stdin answered by response frames on stdout.

mod codec;
mod logging;

use codec::{WireCodec, decode, encode, read_frame, write_frame};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use spl_db::{
    Error, ExecutionContext, ExtensionLibrary, GeoJsonOptions, InitMessage, Request, Response,
};
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_QUEUE: usize = 64;

/// Command line and environment settings. Engine flags are applied on top of
/// the options carried by the init message.
#[derive(Debug, Default, PartialEq)]
struct Settings {
    root: Option<PathBuf>,
    max_queue: usize,
    no_auto_json: bool,
    no_geojson: bool,
    geojson_precision: Option<u8>,
    geojson_options: Option<u8>,
    log_level: String,
    /// Reported once logging is up.
    unknown: Vec<String>,
}

impl Settings {
    fn parse<I, E>(args: I, env: E) -> Self
    where
        I: IntoIterator<Item = String>,
        E: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings {
            root: env("SPL_ROOT").map(PathBuf::from),
            max_queue: env("SPL_MAX_QUEUE")
                .and_then(|val| val.parse().ok())
                .unwrap_or(DEFAULT_MAX_QUEUE),
            log_level: "info".to_string(),
            ..Settings::default()
        };
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--root" => settings.root = args.next().map(PathBuf::from).or(settings.root),
                "--max-queue" => {
                    if let Some(val) = args.next() {
                        settings.max_queue = val.parse().unwrap_or(DEFAULT_MAX_QUEUE)
                    }
                }
                "--no-auto-json" => settings.no_auto_json = true,
                "--no-geojson" => settings.no_geojson = true,
                "--geojson-precision" => {
                    settings.geojson_precision = args.next().and_then(|val| val.parse().ok())
                }
                "--geojson-options" => {
                    settings.geojson_options = args.next().and_then(|val| val.parse().ok())
                }
                "--log-level" => {
                    if let Some(val) = args.next() {
                        settings.log_level = val
                    }
                }
                "--stdio" => {}
                other => settings.unknown.push(other.to_string()),
            }
        }
        settings.max_queue = settings.max_queue.max(1);
        settings
    }

    fn apply(&self, mut init: InitMessage) -> InitMessage {
        if init.root.is_none() {
            init.root = self.root.clone();
        }
        if self.no_auto_json {
            init.options = init.options.without_json();
        }
        if self.no_geojson {
            init.options = init.options.without_geojson();
        } else if self.geojson_precision.is_some() || self.geojson_options.is_some() {
            let current = init.options.auto_geojson.unwrap_or_default();
            init.options = init.options.with_geojson(GeoJsonOptions::new(
                self.geojson_precision.unwrap_or(current.precision),
                self.geojson_options.unwrap_or(current.options),
            ));
        }
        init
    }
}

fn write_message<W: Write>(writer: &mut W, response: &Response, wire: WireCodec) -> io::Result<()> {
    let encoded =
        encode(response, wire).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    write_frame(writer, &encoded)
}

fn main() -> io::Result<()> {
    let settings = Settings::parse(env::args().skip(1), |key| env::var(key).ok());
    logging::init(&settings.log_level);
    for argument in &settings.unknown {
        warn!(argument = argument.as_str(), "ignoring unknown argument");
    }

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let Some(frame) = read_frame(&mut reader)? else {
        return Ok(());
    };
    let (init, wire) = match decode::<InitMessage>(&frame) {
        Ok(decoded) => decoded,
        Err(err) => {
            error!(error = %err, "invalid init message");
            let failure = Response::failure(0, &Error::Protocol(err.clone()));
            write_message(&mut io::stdout().lock(), &failure, WireCodec::Json)?;
            return Err(io::Error::new(io::ErrorKind::InvalidData, err));
        }
    };
    let context = match ExecutionContext::initialize(settings.apply(init), &ExtensionLibrary::new())
    {
        Ok(context) => context,
        Err(err) => {
            error!(error = %err, "initialization failed");
            write_message(&mut io::stdout().lock(), &Response::failure(0, &err), wire)?;
            return Err(io::Error::other(err.to_string()));
        }
    };
    write_message(&mut io::stdout().lock(), &Response::ready(), wire)?;
    info!(max_queue = settings.max_queue, "worker ready");

    let (request_tx, request_rx) = bounded::<(WireCodec, Request)>(settings.max_queue);
    let (response_tx, response_rx) = bounded::<(WireCodec, Response)>(settings.max_queue);

    let executor = {
        let response_tx = response_tx.clone();
        thread::Builder::new()
            .name("spl-executor".to_string())
            .spawn(move || execute_loop(context, request_rx, response_tx))?
    };
    let writer = thread::Builder::new()
        .name("spl-writer".to_string())
        .spawn(move || write_loop(response_rx))?;

    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "failed to read request");
                let failure = Response::failure(0, &Error::Protocol(err.to_string()));
                let _ = response_tx.send((WireCodec::Json, failure));
                break;
            }
        };
        let (request, wire) = match decode::<Request>(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "dropping undecodable request");
                let _ = response_tx.send((WireCodec::Json, Response::failure(0, &Error::Protocol(err))));
                continue;
            }
        };
        match request_tx.try_send((wire, request)) {
            Ok(()) => {}
            Err(TrySendError::Full((wire, request))) => {
                warn!(request_id = request.request_id, "queue full");
                let busy = Error::Transport("Worker queue full".to_string());
                let _ = response_tx.send((wire, Response::failure(request.request_id, &busy)));
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    drop(request_tx);
    drop(response_tx);
    let _ = executor.join();
    let _ = writer.join();
    debug!("worker stopped");
    Ok(())
}

/// Requests run strictly one at a time against the single context. After a
/// crash the context is dropped and every later request fails.
fn execute_loop(
    context: ExecutionContext,
    request_rx: Receiver<(WireCodec, Request)>,
    response_tx: Sender<(WireCodec, Response)>,
) {
    let mut context = Some(context);
    while let Ok((wire, request)) = request_rx.recv() {
        let response = match context.as_mut() {
            Some(live) => match live.try_dispatch(request) {
                Ok(response) => response,
                Err(crashed) => {
                    context = None;
                    crashed.response
                }
            },
            None => {
                let terminated = Error::Transport("Worker terminated".to_string());
                Response::failure(request.request_id, &terminated)
            }
        };
        if response_tx.send((wire, response)).is_err() {
            break;
        }
    }
    match context {
        Some(context) => debug!(live = context.registry().live(), "executor stopped"),
        None => warn!("executor stopped after a crash"),
    }
}

fn write_loop(response_rx: Receiver<(WireCodec, Response)>) {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    while let Ok((wire, response)) = response_rx.recv() {
        let encoded = match encode(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            error!(error = %err, "failed to write response");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spl_db::{
        AppliesTo, Builtin, Command, ErrorKind, ExtensionDescriptor, ExtensionModule, Operation,
        Reply, SplOptions, Step, Target, Value,
    };
    use std::collections::HashMap;

    fn parse(args: &[&str], env: &[(&str, &str)]) -> Settings {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Settings::parse(args.iter().map(|arg| arg.to_string()), |key| env.get(key).cloned())
    }

    #[test]
    fn defaults_come_from_the_environment() {
        let settings = parse(&[], &[("SPL_ROOT", "/srv/spl"), ("SPL_MAX_QUEUE", "8")]);
        assert_eq!(settings.root, Some(PathBuf::from("/srv/spl")));
        assert_eq!(settings.max_queue, 8);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn flags_override_the_environment() {
        let settings = parse(
            &["--root", "/tmp/x", "--max-queue", "0", "--log-level", "debug", "--no-auto-json"],
            &[("SPL_ROOT", "/srv/spl")],
        );
        assert_eq!(settings.root, Some(PathBuf::from("/tmp/x")));
        assert_eq!(settings.max_queue, 1);
        assert_eq!(settings.log_level, "debug");
        assert!(settings.no_auto_json);
        assert!(settings.unknown.is_empty());
    }

    #[test]
    fn unknown_arguments_are_kept_for_reporting() {
        let settings = parse(&["--stdio", "--verbose", "--no-geojson", "extra"], &[]);
        assert_eq!(settings.unknown, vec!["--verbose".to_string(), "extra".to_string()]);
        assert!(settings.no_geojson);
    }

    #[test]
    fn engine_flags_apply_on_top_of_init_options() {
        let settings = parse(&["--geojson-precision", "3", "--root", "/data"], &[]);
        let init = settings.apply(InitMessage::default());
        assert_eq!(init.root, Some(PathBuf::from("/data")));
        let geojson = init.options.auto_geojson.expect("geojson");
        assert_eq!(geojson.precision, 3);

        let disabled = parse(&["--no-geojson"], &[]).apply(InitMessage {
            options: SplOptions::default(),
            root: Some(PathBuf::from("/kept")),
            ..InitMessage::default()
        });
        assert!(disabled.options.auto_geojson.is_none());
        assert_eq!(disabled.root, Some(PathBuf::from("/kept")));
    }

    #[test]
    fn executor_answers_in_request_codec() {
        let context = ExecutionContext::initialize(InitMessage::default(), &ExtensionLibrary::new())
            .expect("context");
        let (request_tx, request_rx) = bounded(4);
        let (response_tx, response_rx) = bounded(4);
        request_tx
            .send((
                WireCodec::Msgpack,
                Request::batch(
                    5,
                    vec![
                        Command::new(Builtin::Open, Some(1), Vec::new()),
                        Command::new(Builtin::Exec, Some(1), vec!["select 2 * 21".into()]),
                        Command::new(Builtin::ResFirst, Some(1), Vec::new()),
                    ],
                ),
            ))
            .expect("send");
        drop(request_tx);
        execute_loop(context, request_rx, response_tx);
        let (wire, response) = response_rx.recv().expect("response");
        assert_eq!(wire, WireCodec::Msgpack);
        assert_eq!(response.request_id, 5);
        assert_eq!(response.result, Some(Reply::Value(Value::from(42))));
    }

    fn explode(_: Target<'_>, _: Vec<Value>) -> spl_db::Result<Step> {
        panic!("extension exploded");
    }

    #[test]
    fn executor_fails_every_request_after_a_crash() {
        let init = InitMessage {
            extensions: vec![
                ExtensionDescriptor::new(AppliesTo::Spl, "boom").function("explode", "explode"),
            ],
            ..InitMessage::default()
        };
        let library = ExtensionLibrary::new()
            .register("boom", ExtensionModule::new().export("explode", explode));
        let context = ExecutionContext::initialize(init, &library).expect("context");
        let (request_tx, request_rx) = bounded(4);
        let (response_tx, response_rx) = bounded(4);
        let explode = Command::new(Operation::parse("explode"), None, Vec::new());
        let version = Command::new(Builtin::Version, None, Vec::new());
        request_tx
            .send((WireCodec::Json, Request::batch(1, vec![explode])))
            .expect("send");
        request_tx
            .send((WireCodec::Json, Request::batch(2, vec![version])))
            .expect("send");
        drop(request_tx);
        execute_loop(context, request_rx, response_tx);

        let (_, crashed) = response_rx.recv().expect("crash response");
        assert_eq!(crashed.request_id, 1);
        assert_eq!(crashed.kind, Some(ErrorKind::Transport));
        assert!(crashed.error.contains("extension exploded"));
        let (_, later) = response_rx.recv().expect("later response");
        assert_eq!(later.request_id, 2);
        assert_eq!(later.error, "Worker terminated");
        assert_eq!(later.kind, Some(ErrorKind::Transport));
    }

    #[test]
    fn failures_encode_with_kind() {
        let response = Response::failure(9, &Error::Transport("Worker queue full".to_string()));
        let mut out = Vec::new();
        write_message(&mut out, &response, WireCodec::Json).expect("write");
        let text = String::from_utf8(out[4..].to_vec()).expect("utf8");
        assert!(text.contains(r#""error":"Worker queue full""#));
        assert!(text.contains(r#""kind":"transport""#));
    }
}
