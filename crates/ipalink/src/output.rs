use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ipalink_frame::{ByteArray, DELIMITER};
use ipalink_session::Response;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    size: usize,
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<ResponseOutput<'a>>,
    timestamp: String,
}

#[derive(Serialize)]
struct ResponseOutput<'a> {
    job_id: u64,
    cmd: u32,
    status: bool,
    data: &'a str,
}

impl<'a> From<&'a Response> for ResponseOutput<'a> {
    fn from(response: &'a Response) -> Self {
        Self {
            job_id: response.job_id,
            cmd: response.cmd,
            status: response.status,
            data: &response.data,
        }
    }
}

pub fn print_frame(frame: &ByteArray, format: OutputFormat) {
    let response = Response::parse(frame).ok();
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                size: frame.len(),
                payload: payload_preview(frame),
                response: response.as_ref().map(ResponseOutput::from),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (job, status) = match &response {
                Some(response) => (
                    response.job_id.to_string(),
                    if response.status { "ok" } else { "failed" }.to_string(),
                ),
                None => ("-".to_string(), "-".to_string()),
            };
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SIZE", "JOB", "STATUS", "PAYLOAD"])
                .add_row(vec![
                    frame.len().to_string(),
                    job,
                    status,
                    payload_preview(frame),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match &response {
            Some(response) => println!(
                "job={} cmd={} status={} size={} data={}",
                response.job_id,
                response.cmd,
                response.status,
                frame.len(),
                response.data
            ),
            None => println!("size={} payload={}", frame.len(), payload_preview(frame)),
        },
        OutputFormat::Raw => {
            print_raw(frame);
            print_raw(&[DELIMITER]);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
