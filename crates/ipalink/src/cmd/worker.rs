use std::io::{Read, Write};
#[cfg(unix)]
use std::path::Path;

use ipalink_frame::{FrameError, TelegramReader, TelegramWriter};
use ipalink_session::{Request, Response};
use tracing::{debug, info, warn};

use crate::cmd::WorkerArgs;
use crate::exit::{frame_error, CliResult, SUCCESS};

/// Telegram that makes the worker exit.
pub const SHUTDOWN: &[u8] = b"shutdown";

#[derive(Debug, PartialEq, Eq)]
enum Served {
    Disconnected,
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
enum Reply {
    Send(Vec<u8>),
    Shutdown,
}

pub fn run(args: WorkerArgs) -> CliResult<i32> {
    match &args.socket {
        Some(path) => serve_socket(path),
        None => {
            info!("serving telegrams on stdio");
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            let served = serve(stdin.lock(), stdout.lock())?;
            debug!(?served, "stdio session ended");
            Ok(SUCCESS)
        }
    }
}

#[cfg(unix)]
fn serve_socket(path: &Path) -> CliResult<i32> {
    use ipalink_transport::SocketListener;

    use crate::exit::{io_error, transport_error};

    let listener =
        SocketListener::bind(path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %path.display(), "worker listening");

    loop {
        let stream = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;
        let reader = stream
            .try_clone()
            .map_err(|err| io_error("stream clone failed", err))?;
        info!("client connected");

        match serve(reader, stream) {
            Ok(Served::Shutdown) => return Ok(SUCCESS),
            Ok(Served::Disconnected) => info!("client disconnected"),
            Err(err) => warn!(error = %err, "client session failed"),
        }
    }
}

#[cfg(not(unix))]
fn serve_socket(_path: &std::path::Path) -> CliResult<i32> {
    Err(crate::exit::CliError::new(
        crate::exit::USAGE,
        "unix domain sockets are not available on this platform",
    ))
}

fn serve<R: Read, W: Write>(reader: R, writer: W) -> CliResult<Served> {
    let mut reader = TelegramReader::new(reader);
    let mut writer = TelegramWriter::new(writer);
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return Ok(Served::Disconnected),
            Err(err) => return Err(frame_error("receive failed", err)),
        };
        debug!(size = frame.len(), "telegram received");

        match reply_to(&frame) {
            Reply::Shutdown => {
                info!("shutdown requested");
                return Ok(Served::Shutdown);
            }
            Reply::Send(payload) => writer
                .send(&payload)
                .map_err(|err| frame_error("reply failed", err))?,
        }
    }
}

/// Requests get a `STATUS` reply carrying their options back as `DATA`;
/// anything else is echoed unchanged.
fn reply_to(telegram: &[u8]) -> Reply {
    if telegram == SHUTDOWN {
        return Reply::Shutdown;
    }
    let Ok(request) = Request::parse(telegram) else {
        return Reply::Send(telegram.to_vec());
    };

    let response = match request.command() {
        Some(_) => Response::for_request(&request, true, request.options.clone()),
        None => Response::for_request(
            &request,
            false,
            format!("unknown command {}", request.cmd),
        ),
    };
    match response.to_bytes() {
        Ok(payload) => Reply::Send(payload),
        Err(err) => {
            warn!(error = %err, "could not encode response, echoing request");
            Reply::Send(telegram.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use ipalink_session::RequestBuilder;

    use super::*;

    #[test]
    fn plain_telegrams_are_echoed() {
        assert_eq!(reply_to(b"hello"), Reply::Send(b"hello".to_vec()));
        assert_eq!(reply_to(b"{\"x\":1}"), Reply::Send(b"{\"x\":1}".to_vec()));
    }

    #[test]
    fn requests_get_status_replies() {
        let request = RequestBuilder::new().path_list(3, "max", "full", true);
        let Reply::Send(payload) = reply_to(&request.to_bytes().unwrap()) else {
            panic!("expected a reply");
        };
        let response = Response::parse(&payload).unwrap();
        assert_eq!(response.job_id, 1);
        assert_eq!(response.cmd, 0);
        assert!(response.status);
        assert_eq!(response.data, request.options);
    }

    #[test]
    fn unknown_commands_fail() {
        let Reply::Send(payload) = reply_to(br#"{"JOB_ID":"4","CMD":"9","OPTIONS":""}"#) else {
            panic!("expected a reply");
        };
        let response = Response::parse(&payload).unwrap();
        assert_eq!(response.job_id, 4);
        assert!(!response.status);
    }

    #[test]
    fn serve_stops_at_shutdown_and_replies_in_order() {
        let input = Cursor::new(b"one\x17two\x17shutdown\x17three\x17".to_vec());
        let mut output = Vec::new();

        let served = serve(input, &mut output).unwrap();

        assert_eq!(served, Served::Shutdown);
        assert_eq!(output, b"one\x17two\x17");
    }

    #[test]
    fn serve_reports_disconnect_at_eof() {
        let input = Cursor::new(b"one\x17partial".to_vec());
        let mut output = Vec::new();

        let served = serve(input, &mut output).unwrap();

        assert_eq!(served, Served::Disconnected);
        assert_eq!(output, b"one\x17");
    }
}
