use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

/// Upper bound on the number of paths a worker is asked for.
pub const MAX_PATH_COUNT: u32 = 10_000;

pub const KEY_JOB_ID: &str = "JOB_ID";
pub const KEY_CMD: &str = "CMD";
pub const KEY_OPTIONS: &str = "OPTIONS";
pub const KEY_STATUS: &str = "STATUS";
pub const KEY_DATA: &str = "DATA";

pub const OPTION_PATH_NUM: &str = "path_num";
pub const OPTION_PATH_TYPE: &str = "path_type";
pub const OPTION_DETAILS_LEVEL: &str = "details_level";
pub const OPTION_IS_FLAT_ROUTING: &str = "is_flat_routing";
pub const OPTION_PATH_ELEMENTS: &str = "path_elements";
pub const OPTION_HIGHLIGHT_MODE: &str = "hight_light_mode";
pub const OPTION_DRAW_PATH_CONTOUR: &str = "draw_path_contour";

/// Worker commands. The numeric ids are part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    GetPathList = 0,
    DrawPath = 1,
}

impl Command {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::GetPathList),
            1 => Some(Self::DrawPath),
            _ => None,
        }
    }
}

/// `type:name:value` entries joined by `;`.
///
/// Values may contain `:` but not `;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    entries: Vec<(String, String, String)>,
}

impl OptionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn int(self, name: &str, value: i64) -> Self {
        self.push("int", name, value.to_string())
    }

    pub fn string(self, name: &str, value: &str) -> Self {
        self.push("string", name, value.to_string())
    }

    /// Booleans travel as `1` / `0`.
    pub fn boolean(self, name: &str, value: bool) -> Self {
        self.push("bool", name, u8::from(value).to_string())
    }

    fn push(mut self, kind: &str, name: &str, value: String) -> Self {
        self.entries.push((kind.to_string(), name.to_string(), value));
        self
    }

    /// Parse an encoded list. Malformed entries are skipped.
    pub fn parse(encoded: &str) -> Self {
        let entries = encoded
            .split(';')
            .filter_map(|entry| {
                let mut parts = entry.splitn(3, ':');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(kind), Some(name), Some(value)) if !kind.is_empty() => {
                        Some((kind.to_string(), name.to_string(), value.to_string()))
                    }
                    _ => None,
                }
            })
            .collect();
        Self { entries }
    }

    /// Raw value of option `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, key, _)| key == name)
            .map(|(_, _, value)| value.as_str())
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.parse().ok()
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for OptionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (kind, name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{kind}:{name}:{value}")?;
        }
        Ok(())
    }
}

/// A request telegram payload. Every field travels as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "JOB_ID")]
    pub job_id: String,
    #[serde(rename = "CMD")]
    pub cmd: String,
    #[serde(rename = "OPTIONS", default)]
    pub options: String,
}

impl Request {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn command(&self) -> Option<Command> {
        self.cmd.parse().ok().and_then(Command::from_id)
    }

    pub fn options(&self) -> OptionList {
        OptionList::parse(&self.options)
    }
}

/// Issues requests with increasing job ids, starting at 1.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    last_job_id: u64,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for up to `path_count` timing paths, clamped to [`MAX_PATH_COUNT`].
    pub fn path_list(
        &mut self,
        path_count: u32,
        path_type: &str,
        details_level: &str,
        flat_routing: bool,
    ) -> Request {
        let options = OptionList::new()
            .int(OPTION_PATH_NUM, i64::from(path_count.min(MAX_PATH_COUNT)))
            .string(OPTION_PATH_TYPE, path_type)
            .string(OPTION_DETAILS_LEVEL, details_level)
            .boolean(OPTION_IS_FLAT_ROUTING, flat_routing);
        self.raw(Command::GetPathList, options)
    }

    /// Ask the worker to highlight the given path elements.
    pub fn draw_path_items(
        &mut self,
        items: &str,
        highlight_mode: &str,
        draw_contour: bool,
    ) -> Request {
        let options = OptionList::new()
            .string(OPTION_PATH_ELEMENTS, items)
            .string(OPTION_HIGHLIGHT_MODE, highlight_mode)
            .boolean(OPTION_DRAW_PATH_CONTOUR, draw_contour);
        self.raw(Command::DrawPath, options)
    }

    pub fn raw(&mut self, cmd: Command, options: impl fmt::Display) -> Request {
        self.last_job_id += 1;
        Request {
            job_id: self.last_job_id.to_string(),
            cmd: cmd.id().to_string(),
            options: options.to_string(),
        }
    }

    pub fn last_job_id(&self) -> u64 {
        self.last_job_id
    }
}

/// A worker reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub job_id: u64,
    pub cmd: u32,
    pub status: bool,
    pub data: String,
}

impl Response {
    pub fn for_request(request: &Request, status: bool, data: impl Into<String>) -> Self {
        Self {
            job_id: request.job_id.parse().unwrap_or(0),
            cmd: request.cmd.parse().unwrap_or(u32::MAX),
            status,
            data: data.into(),
        }
    }

    /// Parse a reply. Integer fields may be JSON strings or numbers;
    /// `DATA` is optional.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = value
            .as_object()
            .ok_or_else(|| SessionError::InvalidResponse("not a JSON object".to_string()))?;

        let job_id = integer_field(object, KEY_JOB_ID)?;
        let cmd = u32::try_from(integer_field(object, KEY_CMD)?)
            .map_err(|_| SessionError::InvalidResponse(format!("{KEY_CMD} out of range")))?;
        let status = integer_field(object, KEY_STATUS)? != 0;
        let data = match object.get(KEY_DATA) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(data)) => data.clone(),
            Some(other) => other.to_string(),
        };

        Ok(Self {
            job_id,
            cmd,
            status,
            data,
        })
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_id(self.cmd)
    }

    /// Encode with every field as a JSON string.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::json!({
            KEY_JOB_ID: self.job_id.to_string(),
            KEY_CMD: self.cmd.to_string(),
            KEY_STATUS: u8::from(self.status).to_string(),
            KEY_DATA: self.data,
        });
        Ok(serde_json::to_vec(&value)?)
    }
}

fn integer_field(object: &serde_json::Map<String, Value>, key: &str) -> Result<u64> {
    let invalid = |what: &str| SessionError::InvalidResponse(format!("{what} field {key}"));
    match object.get(key) {
        None => Err(invalid("missing")),
        Some(Value::Number(number)) => number.as_u64().ok_or_else(|| invalid("malformed")),
        Some(Value::String(text)) => text.trim().parse().map_err(|_| invalid("malformed")),
        Some(Value::Bool(flag)) => Ok(u64::from(*flag)),
        Some(_) => Err(invalid("malformed")),
    }
}
