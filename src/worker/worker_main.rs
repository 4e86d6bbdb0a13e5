//! Worker subprocess main entry point.
//!
//! Runs when the binary is invoked as `ballot-interp worker --entry <name>`.
//! Hosts one [`EntryPoint`] and answers job requests from the parent, one at
//! a time, until told to exit or its stdin closes.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{WorkRequest, WorkResponse};
use crate::codec::{self, Envelope, SerializedError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, error, warn};

/// The function a worker process hosts.
pub trait EntryPoint {
    type Input: DeserializeOwned;
    type Output: Serialize;

    fn call(&mut self, input: Self::Input) -> anyhow::Result<Self::Output>;
}

/// Run one job through the entry point and encode its envelope.
///
/// Input decode failures, entry point errors, panics and output encode
/// failures all become an error envelope; the worker keeps serving.
fn run_job<E: EntryPoint>(entry: &mut E, payload: serde_json::Value) -> serde_json::Value {
    let outcome = match codec::decode::<E::Input>(payload) {
        Ok(input) => match catch_unwind(AssertUnwindSafe(|| entry.call(input))) {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(SerializedError::from_anyhow(&err)),
            Err(panic) => Err(SerializedError::from_panic(panic.as_ref())),
        },
        Err(e) => Err(SerializedError::new("CodecError", e.to_string())),
    };

    let envelope = Envelope::from(outcome);
    codec::encode(&envelope).unwrap_or_else(|e| {
        let fallback: Envelope<()> =
            Envelope::error(SerializedError::new("CodecError", e.to_string()));
        // An error envelope of plain strings always encodes.
        codec::encode(&fallback).unwrap_or(serde_json::Value::Null)
    })
}

/// Worker main loop.
///
/// Announces `ready`, then reads requests and writes one response per line.
pub fn serve<E, R, W>(
    entry: &mut E,
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
) -> io::Result<()>
where
    E: EntryPoint,
    R: Read,
    W: Write,
{
    write_response(writer, &WorkResponse::Ready)?;

    loop {
        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            None => {
                debug!("Parent closed the request pipe");
                return Ok(());
            }
        };

        let request = match WorkRequest::from_line(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Invalid request from parent");
                write_response(writer, &WorkResponse::invalid(format!("Invalid request: {}", e)))?;
                continue;
            }
        };

        match request {
            WorkRequest::Exit => return Ok(()),
            WorkRequest::Job { id, payload } => {
                let envelope = run_job(entry, payload);
                write_response(writer, &WorkResponse::reply(id, envelope))?;
            }
        }
    }
}

fn write_response<W: Write>(writer: &mut LineWriter<W>, response: &WorkResponse) -> io::Result<()> {
    let line = response.to_line().map_err(io::Error::other)?;
    writer.write_line(&line)
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 after a clean shutdown, 1 on a pipe error.
pub fn run_worker_main<E: EntryPoint>(mut entry: E) -> ! {
    // Pipe errors surface as io::Error instead of killing the worker.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Safety: descriptors 0 and 1 are the pipes the parent set up, and
    // nothing else in the worker reads stdin or writes stdout.
    let stdin_fd = unsafe { PipeFd::from_raw(0) };
    let stdout_fd = unsafe { PipeFd::from_raw(1) };

    let mut reader = LineReader::new(stdin_fd);
    let mut writer = LineWriter::new(stdout_fd);

    match serve(&mut entry, &mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "Worker IPC failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Page {
        number: u32,
    }

    struct Doubler;

    impl EntryPoint for Doubler {
        type Input = Page;
        type Output = u32;

        fn call(&mut self, input: Page) -> anyhow::Result<u32> {
            match input.number {
                0 => anyhow::bail!("page zero does not exist"),
                13 => panic!("unlucky page"),
                n => Ok(n * 2),
            }
        }
    }

    fn run(requests: &[String]) -> Vec<WorkResponse> {
        let input = requests.concat();
        let mut reader = LineReader::new(input.as_bytes());
        let mut writer = LineWriter::new(Vec::new());
        serve(&mut Doubler, &mut reader, &mut writer).unwrap();

        String::from_utf8(writer.get_ref().clone())
            .unwrap()
            .lines()
            .map(|line| WorkResponse::from_line(line).unwrap())
            .collect()
    }

    fn job(id: u64, payload: serde_json::Value) -> String {
        WorkRequest::job(id, payload).to_line().unwrap()
    }

    fn envelope_of(response: &WorkResponse) -> Envelope<u32> {
        match response {
            WorkResponse::Reply { envelope, .. } => codec::decode(envelope.clone()).unwrap(),
            other => panic!("Expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_then_replies_in_order() {
        let responses = run(&[
            job(1, json!({"number": 4})),
            job(2, json!({"number": 5})),
            WorkRequest::Exit.to_line().unwrap(),
            // Ignored after exit.
            job(3, json!({"number": 6})),
        ]);
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], WorkResponse::Ready);
        assert!(matches!(responses[1], WorkResponse::Reply { id: 1, .. }));
        assert_eq!(envelope_of(&responses[1]), Envelope::ok(8));
        assert_eq!(envelope_of(&responses[2]), Envelope::ok(10));
    }

    #[test]
    fn test_entry_error_becomes_error_envelope() {
        let responses = run(&[job(1, json!({"number": 0}))]);
        let err = envelope_of(&responses[1]).into_result().unwrap_err();
        assert_eq!(err.message, "page zero does not exist");
    }

    #[test]
    fn test_panic_becomes_error_envelope_and_worker_survives() {
        let responses = run(&[job(1, json!({"number": 13})), job(2, json!({"number": 1}))]);
        let err = envelope_of(&responses[1]).into_result().unwrap_err();
        assert_eq!(err.name, "Panic");
        assert_eq!(err.message, "unlucky page");
        assert_eq!(envelope_of(&responses[2]), Envelope::ok(2));
    }

    #[test]
    fn test_undecodable_input_is_codec_error() {
        let responses = run(&[job(1, json!({"pages": "many"}))]);
        let err = envelope_of(&responses[1]).into_result().unwrap_err();
        assert_eq!(err.name, "CodecError");
    }

    #[test]
    fn test_garbage_line_gets_invalid_response() {
        let responses = run(&["not json\n".to_string(), job(1, json!({"number": 3}))]);
        assert!(matches!(responses[1], WorkResponse::Invalid { .. }));
        assert_eq!(envelope_of(&responses[2]), Envelope::ok(6));
    }

    #[test]
    fn test_eof_ends_cleanly() {
        let responses = run(&[]);
        assert_eq!(responses, vec![WorkResponse::Ready]);
    }
}
