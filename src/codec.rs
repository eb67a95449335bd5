// ABOUTME: Per-command request serializer and response interpreter for the SSDB wire protocol
// ABOUTME: Maps command name + arguments to wire bytes, and (command, frame) to a typed result

use crate::error::{SsdbError, SsdbResult};
use crate::frame::Frame;
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::OnceLock;

/// A single command argument, coerced to wire bytes at encode time.
///
/// This is a closed set: text is UTF-8 encoded as-is, integers become their
/// decimal ASCII representation, and raw byte strings pass through
/// unchanged. There is no "other" variant to reject at runtime — the type
/// system already enforces this closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl CommandArg {
    fn to_wire_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            CommandArg::Text(s) => Cow::Borrowed(s.as_bytes()),
            CommandArg::Int(n) => Cow::Owned(n.to_string().into_bytes()),
            CommandArg::Bytes(b) => Cow::Borrowed(b),
        }
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        CommandArg::Text(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        CommandArg::Text(value)
    }
}

impl From<Vec<u8>> for CommandArg {
    fn from(value: Vec<u8>) -> Self {
        CommandArg::Bytes(value)
    }
}

impl From<&[u8]> for CommandArg {
    fn from(value: &[u8]) -> Self {
        CommandArg::Bytes(value.to_vec())
    }
}

macro_rules! impl_from_int {
    ($($t:ty),+ $(,)?) => {
        $(
            impl From<$t> for CommandArg {
                fn from(value: $t) -> Self {
                    CommandArg::Int(value as i64)
                }
            }
        )+
    };
}

impl_from_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

/// Serializes a command name and its arguments into wire bytes.
///
/// Output format per token `t`: `ASCII(len(t)) + "\n" + t + "\n"`; after all
/// tokens, one extra `"\n"` terminates the request. The command name
/// `"delete"` is rewritten to `"del"`, the server's native spelling.
pub struct CommandEncoder;

impl CommandEncoder {
    pub fn encode(name: &str, args: &[CommandArg]) -> Vec<u8> {
        let wire_name = if name == "delete" { "del" } else { name };
        let mut out = Vec::new();
        Self::write_token(&mut out, wire_name.as_bytes());
        for arg in args {
            Self::write_token(&mut out, &arg.to_wire_bytes());
        }
        out.push(b'\n');
        out
    }

    fn write_token(out: &mut Vec<u8>, token: &[u8]) {
        out.extend_from_slice(token.len().to_string().as_bytes());
        out.push(b'\n');
        out.extend_from_slice(token);
        out.push(b'\n');
    }
}

/// One of the seven disjoint response shapes a command's successful reply
/// can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    NoResponse,
    Int,
    Float,
    Bytes,
    List,
    StrMap,
    IntMap,
    StrMapScan,
    IntMapScan,
}

/// The shaped result of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `not_found`, or the shape for commands with no payload (`NO_RESPONSE`).
    Absent,
    Int(i64),
    Float(f64),
    Bytes(Bytes),
    List(Vec<Bytes>),
    StrMap(Vec<(Bytes, Bytes)>),
    IntMap(Vec<(Bytes, i64)>),
    StrMapScan(Option<Bytes>, Vec<(Bytes, Bytes)>),
    IntMapScan(Option<Bytes>, Vec<(Bytes, i64)>),
}

/// Maps `(command, frame)` to a typed [`Value`].
pub struct ResponseInterpreter;

impl ResponseInterpreter {
    pub fn interpret(cmd: &str, frame: Frame) -> SsdbResult<Value> {
        let Some(status) = frame.first() else {
            return Err(SsdbError::ConnectionClosed);
        };

        if status.as_ref() == b"not_found" {
            return Ok(Value::Absent);
        }
        if status.as_ref() != b"ok" {
            return Err(SsdbError::RemoteError(
                String::from_utf8_lossy(status).into_owned(),
            ));
        }

        let class = command_class(cmd).ok_or_else(|| SsdbError::UnknownCommand(cmd.to_string()))?;
        shape(class, &frame[1..])
    }
}

/// Look up `cmd`'s response class in the static command table.
pub fn command_class(cmd: &str) -> Option<CommandClass> {
    command_table().get(cmd).copied()
}

fn command_table() -> &'static HashMap<&'static str, CommandClass> {
    static TABLE: OnceLock<HashMap<&'static str, CommandClass>> = OnceLock::new();
    TABLE.get_or_init(build_command_table)
}

/// Build the `command -> class` table once, at first use. Duplicate
/// registration across classes is an internal consistency bug, not a
/// runtime condition callers can trigger, so it panics rather than
/// returning an error.
fn build_command_table() -> HashMap<&'static str, CommandClass> {
    use CommandClass::*;

    let mut table = HashMap::new();
    let mut register = |class: CommandClass, names: &[&'static str]| {
        for &name in names {
            if table.insert(name, class).is_some() {
                panic!("command `{name}` is registered in more than one response class");
            }
        }
    };

    register(NoResponse, &["ping", "qset"]);
    register(
        Int,
        &[
            "auth",
            "dbsize",
            "set",
            "setx",
            "setnx",
            "expire",
            "ttl",
            "del",
            "incr",
            "decr",
            "exists",
            "getbit",
            "setbit",
            "bitcount",
            "countbit",
            "strlen",
            "multi_set",
            "multi_del",
            "hset",
            "hdel",
            "hincr",
            "hdecr",
            "hexists",
            "hsize",
            "hclear",
            "multi_hset",
            "multi_hdel",
            "zset",
            "zget",
            "zdel",
            "zincr",
            "zdecr",
            "zexists",
            "zsize",
            "zrank",
            "zrrank",
            "zclear",
            "zcount",
            "zsum",
            "zremrangebyrank",
            "zremrangebyscore",
            "multi_zset",
            "multi_zdel",
            "qsize",
            "qclear",
            "qpush",
            "qpush_front",
            "qpush_back",
            "qtrim_front",
            "qtrim_back",
        ],
    );
    register(Float, &["zavg"]);
    register(
        Bytes,
        &[
            "version",
            "get",
            "getset",
            "substr",
            "hget",
            "qfront",
            "qback",
            "qget",
        ],
    );
    register(
        CommandClass::List,
        &[
            "info", "keys", "rkeys", "hlist", "hrlist", "hkeys", "zlist", "zrlist", "zkeys",
            "qlist", "qrlist", "qrange", "qslice", "qpop", "qpop_front", "qpop_back",
        ],
    );
    register(StrMap, &["multi_get", "hgetall", "multi_hget"]);
    register(
        IntMap,
        &[
            "multi_exists",
            "multi_hexists",
            "multi_hsize",
            "zrange",
            "zrrange",
            "zpop_front",
            "zpop_back",
            "multi_zget",
            "multi_zexists",
            "multi_zsize",
        ],
    );
    register(StrMapScan, &["scan", "rscan", "hscan", "hrscan"]);
    register(IntMapScan, &["zscan", "zrscan"]);

    table
}

fn shape(class: CommandClass, body: &[Bytes]) -> SsdbResult<Value> {
    match class {
        CommandClass::NoResponse => Ok(Value::Absent),
        CommandClass::Int => parse_i64(first(body)?).map(Value::Int),
        CommandClass::Float => parse_f64(first(body)?).map(Value::Float),
        CommandClass::Bytes => Ok(Value::Bytes(first(body)?.clone())),
        CommandClass::List => Ok(Value::List(body.to_vec())),
        CommandClass::StrMap => Ok(Value::StrMap(str_pairs(body)?)),
        CommandClass::IntMap => Ok(Value::IntMap(int_pairs(body)?)),
        CommandClass::StrMapScan => {
            let next_start = scan_cursor(body);
            Ok(Value::StrMapScan(next_start, str_pairs(body)?))
        }
        CommandClass::IntMapScan => {
            let next_start = scan_cursor(body);
            Ok(Value::IntMapScan(next_start, int_pairs(body)?))
        }
    }
}

fn first(body: &[Bytes]) -> SsdbResult<&Bytes> {
    body.first()
        .ok_or_else(|| SsdbError::ProtocolError("expected a response body, got none".to_string()))
}

fn parse_i64(bytes: &Bytes) -> SsdbResult<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| SsdbError::ProtocolError(format!("expected an integer, got {bytes:?}")))
}

fn parse_f64(bytes: &Bytes) -> SsdbResult<f64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| SsdbError::ProtocolError(format!("expected a float, got {bytes:?}")))
}

/// `next_start` for a scan continuation is the last key in the body (the
/// second-to-last blob overall, since the body is a flat key/value list),
/// or absent if the body is empty. It duplicates the last pair's key; it
/// does not remove anything from the map.
fn scan_cursor(body: &[Bytes]) -> Option<Bytes> {
    (body.len() >= 2).then(|| body[body.len() - 2].clone())
}

fn str_pairs(body: &[Bytes]) -> SsdbResult<Vec<(Bytes, Bytes)>> {
    if body.len() % 2 != 0 {
        return Err(SsdbError::ProtocolError(
            "map response body has an odd number of elements".to_string(),
        ));
    }
    Ok(body
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// As [`str_pairs`], but values that aren't all-ASCII-digit decode to `-1`
/// instead of failing. This is a legacy coercion preserved for
/// compatibility rather than surfacing `ProtocolError`.
fn int_pairs(body: &[Bytes]) -> SsdbResult<Vec<(Bytes, i64)>> {
    if body.len() % 2 != 0 {
        return Err(SsdbError::ProtocolError(
            "map response body has an odd number of elements".to_string(),
        ));
    }
    Ok(body
        .chunks_exact(2)
        .map(|pair| {
            let key = pair[0].clone();
            let value = coerce_legacy_int(&pair[1]);
            (key, value)
        })
        .collect())
}

fn coerce_legacy_int(bytes: &Bytes) -> i64 {
    if !bytes.is_empty() && bytes.iter().all(u8::is_ascii_digit) {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(-1)
    } else {
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn frame(blobs: &[&str]) -> Frame {
        blobs.iter().map(|s| blob(s)).collect()
    }

    #[test]
    fn encodes_ping_with_no_args() {
        assert_eq!(CommandEncoder::encode("ping", &[]), b"4\nping\n\n".to_vec());
    }

    #[test]
    fn encodes_set_with_args() {
        let args = vec![CommandArg::from("foo"), CommandArg::from("bar")];
        assert_eq!(
            CommandEncoder::encode("set", &args),
            b"3\nset\n3\nfoo\n3\nbar\n\n".to_vec()
        );
    }

    #[test]
    fn renames_delete_to_del() {
        let encoded = CommandEncoder::encode("delete", &[CommandArg::from("foo")]);
        assert!(encoded.starts_with(b"3\ndel\n"));
    }

    #[test]
    fn int_arg_is_decimal_ascii() {
        let encoded = CommandEncoder::encode("expire", &[CommandArg::from("k"), CommandArg::from(-5i64)]);
        assert_eq!(encoded, b"6\nexpire\n1\nk\n2\n-5\n\n".to_vec());
    }

    #[test]
    fn ping_interprets_as_absent() {
        let result = ResponseInterpreter::interpret("ping", frame(&["ok"])).unwrap();
        assert_eq!(result, Value::Absent);
    }

    #[test]
    fn set_interprets_as_int() {
        let result = ResponseInterpreter::interpret("set", frame(&["ok", "1"])).unwrap();
        assert_eq!(result, Value::Int(1));
    }

    #[test]
    fn missing_key_interprets_as_absent() {
        let result = ResponseInterpreter::interpret("get", frame(&["not_found"])).unwrap();
        assert_eq!(result, Value::Absent);
    }

    #[test]
    fn hgetall_interprets_as_str_map() {
        let result =
            ResponseInterpreter::interpret("hgetall", frame(&["ok", "a", "1", "b", "2"])).unwrap();
        assert_eq!(
            result,
            Value::StrMap(vec![(blob("a"), blob("1")), (blob("b"), blob("2"))])
        );
    }

    #[test]
    fn empty_scan_is_absent_cursor_and_empty_map() {
        let result = ResponseInterpreter::interpret("scan", frame(&["ok"])).unwrap();
        assert_eq!(result, Value::StrMapScan(None, vec![]));
    }

    #[test]
    fn scan_cursor_is_last_key() {
        let result = ResponseInterpreter::interpret("scan", frame(&["ok", "a", "1", "b", "2"]))
            .unwrap();
        assert_eq!(
            result,
            Value::StrMapScan(Some(blob("b")), vec![(blob("a"), blob("1")), (blob("b"), blob("2"))])
        );
    }

    #[test]
    fn unknown_status_is_remote_error() {
        let err = ResponseInterpreter::interpret("get", frame(&["error: unknown"])).unwrap_err();
        assert!(matches!(err, SsdbError::RemoteError(ref s) if s == "error: unknown"));
    }

    #[test]
    fn empty_frame_is_connection_closed() {
        let err = ResponseInterpreter::interpret("get", vec![]).unwrap_err();
        assert!(matches!(err, SsdbError::ConnectionClosed));
    }

    #[test]
    fn unregistered_command_is_unknown() {
        let err = ResponseInterpreter::interpret("frobnicate", frame(&["ok"])).unwrap_err();
        assert!(matches!(err, SsdbError::UnknownCommand(ref s) if s == "frobnicate"));
    }

    #[test]
    fn odd_length_map_body_is_protocol_error() {
        let err = ResponseInterpreter::interpret("hgetall", frame(&["ok", "a"])).unwrap_err();
        assert!(matches!(err, SsdbError::ProtocolError(_)));
    }

    #[test]
    fn int_map_coerces_non_digit_values_to_negative_one() {
        let result =
            ResponseInterpreter::interpret("zrange", frame(&["ok", "a", "not-a-number"])).unwrap();
        assert_eq!(result, Value::IntMap(vec![(blob("a"), -1)]));
    }

    #[test]
    fn zavg_interprets_as_float() {
        let result = ResponseInterpreter::interpret("zavg", frame(&["ok", "3.5"])).unwrap();
        assert_eq!(result, Value::Float(3.5));
    }

    #[test]
    fn float_response_with_non_numeric_body_is_protocol_error() {
        let err = ResponseInterpreter::interpret("zavg", frame(&["ok", "not-a-float"])).unwrap_err();
        assert!(matches!(err, SsdbError::ProtocolError(_)));
    }

    #[test]
    fn get_interprets_as_bytes() {
        let result = ResponseInterpreter::interpret("get", frame(&["ok", "value"])).unwrap();
        assert_eq!(result, Value::Bytes(blob("value")));
    }

    #[test]
    fn qrange_interprets_as_list() {
        let result = ResponseInterpreter::interpret("qrange", frame(&["ok", "a", "b", "c"])).unwrap();
        assert_eq!(result, Value::List(vec![blob("a"), blob("b"), blob("c")]));
    }

    #[test]
    fn empty_list_response_is_empty_vec() {
        let result = ResponseInterpreter::interpret("info", frame(&["ok"])).unwrap();
        assert_eq!(result, Value::List(vec![]));
    }

    #[test]
    fn empty_int_map_scan_is_absent_cursor_and_empty_map() {
        let result = ResponseInterpreter::interpret("zscan", frame(&["ok"])).unwrap();
        assert_eq!(result, Value::IntMapScan(None, vec![]));
    }

    #[test]
    fn int_map_scan_cursor_is_last_key_and_values_are_parsed_ints() {
        let result =
            ResponseInterpreter::interpret("zscan", frame(&["ok", "a", "1", "b", "2"])).unwrap();
        assert_eq!(
            result,
            Value::IntMapScan(Some(blob("b")), vec![(blob("a"), 1), (blob("b"), 2)])
        );
    }

    #[test]
    fn int_map_scan_coerces_non_digit_values_to_negative_one() {
        let result =
            ResponseInterpreter::interpret("zrscan", frame(&["ok", "a", "nope"])).unwrap();
        assert_eq!(result, Value::IntMapScan(Some(blob("a")), vec![(blob("a"), -1)]));
    }
}
