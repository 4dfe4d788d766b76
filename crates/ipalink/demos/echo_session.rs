//! Runs `cat` as a worker over its stdio pipes and sends it one request.
//! Whatever goes in comes straight back, so the reply is the request itself.
//!
//! Run with:
//!   cargo run -p ipalink --example echo-session

use std::time::Duration;

use ipalink::session::RequestBuilder;
use ipalink::{ClientSession, SessionConfig, SessionEvent, TransportConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let session = ClientSession::new(SessionConfig {
        transport: TransportConfig::Pipe,
        worker_name: "cat".to_string(),
        ..SessionConfig::default()
    })?;
    let events = session.subscribe();

    session.request_start("cat")?;

    let mut requests = RequestBuilder::new();
    loop {
        match events.recv_timeout(Duration::from_secs(5))? {
            SessionEvent::ConnectionChanged(true) => {
                let request = requests.path_list(5, "max", "full", false);
                eprintln!("Sending job {}", request.job_id);
                session.send_request(&request)?;
            }
            SessionEvent::FrameReceived(frame) => {
                eprintln!("Received {} bytes: {frame}", frame.len());
                break;
            }
            other => eprintln!("{other:?}"),
        }
    }

    eprintln!("Stopped: {:?}", session.request_stop());
    Ok(())
}
