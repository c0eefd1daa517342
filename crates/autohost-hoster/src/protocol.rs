use base64::Engine;
use serde_json::Value;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Join verdict reason code understood by the game's async join approval.
const JOIN_REASON_CODE: u8 = 7;

/// One command line written to the child's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    ChatBroadcast(String),
    ChatDirect { pubkey_b64: String, text: String },
    BanIp { ip: String, reason: String },
    UnbanIp(String),
    ChatMute(String),
    Shutdown,
    JoinApprove(String),
    JoinApproveSpectator(String),
    JoinReject { join_id: String, text: String },
}

/// The child splits on line breaks, so embedded ones travel escaped.
fn escape(text: &str) -> String {
    text.replace('\r', "").replace('\n', "\\n")
}

impl std::fmt::Display for ControlLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChatBroadcast(text) => write!(f, "chat bcast {}", escape(text)),
            Self::ChatDirect { pubkey_b64, text } => {
                write!(f, "chat direct {pubkey_b64} {}", escape(text))
            }
            Self::BanIp { ip, reason } => write!(f, "ban ip {ip} {}", escape(reason)),
            Self::UnbanIp(ip) => write!(f, "unban ip {ip}"),
            Self::ChatMute(pubkey_b64) => write!(f, "set chat mute {pubkey_b64}"),
            Self::Shutdown => write!(f, "shutdown now"),
            Self::JoinApprove(join_id) => write!(f, "join approve {join_id} {JOIN_REASON_CODE}"),
            Self::JoinApproveSpectator(join_id) => {
                write!(f, "join approvespec {join_id} {JOIN_REASON_CODE}")
            }
            Self::JoinReject { join_id, text } => {
                write!(f, "join reject {join_id} {JOIN_REASON_CODE} {}", escape(text))
            }
        }
    }
}

impl ControlLine {
    pub fn broadcast(text: impl Into<String>) -> Self {
        Self::ChatBroadcast(text.into())
    }

    pub fn direct(pubkey_b64: &str, text: impl Into<String>) -> Self {
        Self::ChatDirect {
            pubkey_b64: pubkey_b64.to_string(),
            text: text.into(),
        }
    }

    /// Bytes as written to the pipe.
    pub fn to_wire(&self) -> String {
        format!("\n{self}\n")
    }
}

/// Keeps ASCII letters, digits and spaces.
pub fn sanitize_broadcast(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub join_id: String,
    pub ip: String,
    pub hash: String,
    pub pubkey: Vec<u8>,
    pub pubkey_b64: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub in_game: bool,
    pub ip: String,
    pub pubkey: Vec<u8>,
    pub pubkey_b64: String,
    pub hash: String,
    pub name: String,
    pub message: String,
}

/// A classified line read from the child.
#[derive(Debug, Clone, PartialEq)]
pub enum HosterMessage {
    StdinReady,
    RoomStatus(Value),
    JoinApprovalNeeded(JoinRequest),
    PlayerJoined { slot: usize, pubkey_b64: String },
    PlayerLeft { ip: String },
    MovedToSpectators { pubkey_b64: String },
    MovedToPlayers { pubkey_b64: String },
    GameStarted,
    GameId(i64),
    Graph(Value),
    Chat(ChatLine),
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{kind}: expected {expected} fields, got {got}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("{kind}: bad base64 in {field}")]
    Base64 {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{kind}: {source}")]
    Json {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("{kind}: bad number {value:?}")]
    Number { kind: &'static str, value: String },
}

fn fields<'a>(
    kind: &'static str,
    rest: &'a str,
    expected: usize,
) -> Result<Vec<&'a str>, ParseError> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() != expected {
        return Err(ParseError::FieldCount {
            kind,
            expected,
            got: parts.len(),
        });
    }
    Ok(parts)
}

fn decode(kind: &'static str, field: &'static str, v: &str) -> Result<Vec<u8>, ParseError> {
    B64.decode(v).map_err(|_| ParseError::Base64 { kind, field })
}

fn decode_text(kind: &'static str, field: &'static str, v: &str) -> Result<String, ParseError> {
    Ok(String::from_utf8_lossy(&decode(kind, field, v)?).into_owned())
}

fn json(kind: &'static str, rest: &str) -> Result<Value, ParseError> {
    serde_json::from_str(rest.trim()).map_err(|source| ParseError::Json { kind, source })
}

fn parse_chat(in_game: bool, rest: &str) -> Result<HosterMessage, ParseError> {
    let kind = if in_game { "game chat" } else { "lobby chat" };
    let f = fields(kind, rest, 5)?;
    Ok(HosterMessage::Chat(ChatLine {
        in_game,
        ip: f[0].to_string(),
        pubkey: decode(kind, "pubkey", f[1])?,
        pubkey_b64: f[1].to_string(),
        hash: f[2].to_string(),
        name: decode_text(kind, "name", f[3])?,
        message: decode_text(kind, "message", f[4])?,
    }))
}

fn parse_event(ev: &str) -> Result<HosterMessage, ParseError> {
    if let Some(rest) = ev.strip_prefix("join approval needed:") {
        let kind = "join approval";
        let f = fields(kind, rest, 5)?;
        return Ok(HosterMessage::JoinApprovalNeeded(JoinRequest {
            join_id: f[0].to_string(),
            ip: f[1].to_string(),
            hash: f[2].to_string(),
            pubkey: decode(kind, "pubkey", f[3])?,
            pubkey_b64: f[3].to_string(),
            name: decode_text(kind, "name", f[4])?,
        }));
    }
    if let Some(rest) = ev.strip_prefix("player joined:") {
        let kind = "player joined";
        let f = fields(kind, rest, 2)?;
        let slot = f[0].parse().map_err(|_| ParseError::Number {
            kind,
            value: f[0].to_string(),
        })?;
        return Ok(HosterMessage::PlayerJoined {
            slot,
            pubkey_b64: f[1].to_string(),
        });
    }
    if let Some(rest) = ev.strip_prefix("player left:") {
        let f = fields("player left", rest, 1)?;
        return Ok(HosterMessage::PlayerLeft { ip: f[0].to_string() });
    }
    if let Some(rest) = ev.strip_prefix("moved to spectators:") {
        let f = fields("moved to spectators", rest, 1)?;
        return Ok(HosterMessage::MovedToSpectators {
            pubkey_b64: f[0].to_string(),
        });
    }
    if let Some(rest) = ev.strip_prefix("moved to players:") {
        let f = fields("moved to players", rest, 1)?;
        return Ok(HosterMessage::MovedToPlayers {
            pubkey_b64: f[0].to_string(),
        });
    }
    if let Some(rest) = ev.strip_prefix("gameid:") {
        let v = rest.trim();
        let id = v.parse().map_err(|_| ParseError::Number {
            kind: "gameid",
            value: v.to_string(),
        })?;
        return Ok(HosterMessage::GameId(id));
    }
    if ev.trim() == "startgame" {
        return Ok(HosterMessage::GameStarted);
    }
    Ok(HosterMessage::Unknown)
}

pub fn parse_line(line: &str) -> Result<HosterMessage, ParseError> {
    if line.trim() == "WZCMD: stdinReadReady" {
        return Ok(HosterMessage::StdinReady);
    }
    if let Some(rest) = line.strip_prefix("__WZROOMSTATUS__") {
        return Ok(HosterMessage::RoomStatus(json("room status", rest)?));
    }
    if let Some(rest) = line.strip_prefix("__WZGRAPH__") {
        return Ok(HosterMessage::Graph(json("graph", rest)?));
    }
    if let Some(rest) = line.strip_prefix("WZCHATLOB:") {
        return parse_chat(false, rest);
    }
    if let Some(rest) = line.strip_prefix("WZCHATGAM:") {
        return parse_chat(true, rest);
    }
    if let Some(rest) = line.strip_prefix("WZEVENT: ") {
        return parse_event(rest);
    }
    Ok(HosterMessage::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        B64.encode(s)
    }

    #[test]
    fn control_lines_render_wire_text() {
        assert_eq!(ControlLine::Shutdown.to_wire(), "\nshutdown now\n");
        assert_eq!(
            ControlLine::BanIp {
                ip: "1.2.3.4".into(),
                reason: "line one\nline two".into()
            }
            .to_string(),
            "ban ip 1.2.3.4 line one\\nline two"
        );
        assert_eq!(
            ControlLine::JoinReject {
                join_id: "j1".into(),
                text: "nope".into()
            }
            .to_string(),
            "join reject j1 7 nope"
        );
        assert_eq!(ControlLine::ChatMute("AAA=".into()).to_string(), "set chat mute AAA=");
    }

    #[test]
    fn sanitize_strips_everything_but_alnum_and_space() {
        assert_eq!(sanitize_broadcast("Hi! <b>there</b> ⚠ 42"), "Hi bthereb  42");
    }

    #[test]
    fn parses_join_request() {
        let line = format!(
            "WZEVENT: join approval needed: j7 10.0.0.1 abcdef {} {}",
            b64("key"),
            b64("Player")
        );
        let Ok(HosterMessage::JoinApprovalNeeded(req)) = parse_line(&line) else {
            panic!("not a join request");
        };
        assert_eq!(req.join_id, "j7");
        assert_eq!(req.pubkey, b"key");
        assert_eq!(req.name, "Player");
    }

    #[test]
    fn parses_chat_and_state_lines() {
        let line = format!(
            "WZCHATLOB: 10.0.0.2 {} ff00 {} {}",
            b64("pk"),
            b64("bob"),
            b64("/poke 1")
        );
        let Ok(HosterMessage::Chat(chat)) = parse_line(&line) else {
            panic!("not chat");
        };
        assert!(!chat.in_game);
        assert_eq!(chat.message, "/poke 1");

        assert_eq!(parse_line("WZEVENT: startgame").ok(), Some(HosterMessage::GameStarted));
        assert_eq!(parse_line("WZEVENT: gameid: 55").ok(), Some(HosterMessage::GameId(55)));
        assert_eq!(
            parse_line("WZCMD: stdinReadReady").ok(),
            Some(HosterMessage::StdinReady)
        );
        assert_eq!(parse_line("random noise").ok(), Some(HosterMessage::Unknown));
    }

    #[test]
    fn malformed_known_lines_are_errors() {
        assert!(parse_line("WZEVENT: join approval needed: j7 10.0.0.1").is_err());
        assert!(parse_line("__WZROOMSTATUS__ {not json").is_err());
        assert!(parse_line("WZEVENT: gameid: x").is_err());
    }
}
