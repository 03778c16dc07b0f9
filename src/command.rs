//! Command parsing for the native, whitespace-separated wire frame (spec
//! §6.1's "native frames" mode — the one concrete transport this crate
//! implements; line-protocol/HTTP/WebSocket framing is a seam, see
//! `wire::transport`).

use crate::error::{CommandError, CommandResult};
use crate::geometry::Geometry;
use crate::hook::{Detect, OutputMode, RoamSpec, WhereClause, WhereInClause};
use crate::object::{FieldValue, Value};
use once_cell::sync::Lazy;
use regex::Regex;

/// Translate a glob pattern (`*`, `?`, `[abc]`) into an anchored regex, used
/// by `KEYS`, `PDEL`, `HOOKS`, and id-pattern matching in fences. `regex` is
/// already a teacher dependency; this avoids pulling in a separate `glob`
/// crate for a pattern language the wire protocol defines itself.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '\\' | '{' | '}' => {
                re.push('\\');
                re.push(c);
            }
            '[' | ']' => re.push(c),
            other => re.push(other),
        }
    }
    re.push('$');
    Regex::new(&re).unwrap_or_else(|_| Regex::new("^$").unwrap())
}

/// The `[lo, hi)` bound a glob prefix implies, so range scans can avoid
/// walking the whole key space (spec §4.1 `scanRange`).
pub fn glob_prefix_bounds(pattern: &str) -> Option<(String, String)> {
    let prefix: String = pattern.chars().take_while(|c| !"*?[".contains(*c)).collect();
    if prefix.is_empty() || prefix.len() == pattern.len() {
        return None;
    }
    let mut hi = prefix.clone().into_bytes();
    let last = hi.pop()?;
    hi.push(last + 1);
    Some((prefix, String::from_utf8(hi).ok()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NxXx {
    None,
    Nx,
    Xx,
}

#[derive(Debug, Clone)]
pub struct SetArgs {
    pub key: String,
    pub id: String,
    pub fields: Vec<(String, FieldValue)>,
    pub ex: Option<f64>,
    pub nx_xx: NxXx,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct ScanArgs {
    pub key: String,
    pub cursor: usize,
    pub limit: Option<usize>,
    pub matches: Option<String>,
    pub reverse: bool,
    pub wheres: Vec<WhereClause>,
    pub whereins: Vec<WhereInClause>,
    pub nofields: bool,
    pub output: OutputMode,
}

#[derive(Debug, Clone)]
pub struct SearchArgs {
    pub base: ScanArgs,
    pub geometry_kind: SearchKind,
}

/// An area argument as written on the wire: either a literal geometry, or a
/// `GET key id` reference that must be resolved against the store at
/// execution time (the parser has no store access).
#[derive(Debug, Clone)]
pub enum AreaSpec {
    Literal(Geometry),
    Ref { key: String, id: String },
}

#[derive(Debug, Clone)]
pub enum SearchKind {
    Scan,
    Nearby { origin: AreaSpec },
    Within { area: AreaSpec },
    Intersects { area: AreaSpec, clip: bool },
}

#[derive(Debug, Clone)]
pub struct FenceArgs {
    pub search: SearchArgs,
    pub detect: Vec<Detect>,
    pub commands: Option<Vec<String>>,
    pub roam: Option<RoamSpec>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Set(SetArgs),
    Fset { key: String, id: String, xx: bool, fields: Vec<(String, FieldValue)> },
    Get { key: String, id: String, withfields: bool, output: OutputMode },
    Del { key: String, id: String, erron404: bool },
    Pdel { key: String, pattern: String },
    Drop { key: String },
    FlushDb,
    Rename { key: String, new_key: String, nx: bool },
    Expire { key: String, id: String, seconds: f64 },
    Persist { key: String, id: String },
    Ttl { key: String, id: String },
    Type { key: String },
    Bounds { key: String },
    Keys { pattern: String },
    Stats { keys: Vec<String> },
    Scan(SearchArgs),
    SetHook { name: String, endpoints: Vec<String>, fence: FenceArgs },
    SetChan { name: String, channel: String, fence: FenceArgs },
    DelHook { name: String },
    PdelHook { pattern: String },
    Hooks { pattern: String },
    Subscribe { channels: Vec<String> },
    Psubscribe { patterns: Vec<String> },
    Publish { channel: String, message: String },
    Config { action: ConfigAction },
    Follow { host: Option<(String, u16)> },
    ReadOnly(bool),
    Aof { pos: u64 },
    AofMd5 { pos: u64, size: u64 },
    AofShrink,
    Auth { password: String },
    Output(OutputFormat),
    Ping,
    Quit,
    Client { args: Vec<String> },
    Replconf,
    Info,
    Server,
    Chans { pattern: String },
    Jget { key: String, id: String, path: String, raw: bool },
    Jset { key: String, id: String, path: String, value: String, raw: bool },
    Jdel { key: String, id: String, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Resp,
    Json,
}

#[derive(Debug, Clone)]
pub enum ConfigAction {
    Get(String),
    Set(String, String),
    Rewrite,
}

fn tok(args: &[String], i: usize) -> CommandResult<&str> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CommandError::Syntax("unexpected end of arguments".into()))
}

fn parse_f64(s: &str) -> CommandResult<f64> {
    s.parse().map_err(|_| CommandError::Syntax(format!("expected number, got {s}")))
}

static FIELD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());

fn is_reserved_field(name: &str) -> bool {
    matches!(name, "z" | "lat" | "lon")
}

/// Parse `OBJECT json | POINT lat lon [z] | BOUNDS minlat minlon maxlat maxlon | HASH gh | STRING s`
/// starting at `args[i]`; returns the value and the next index.
fn parse_value(args: &[String], i: usize) -> CommandResult<(Value, usize)> {
    match tok(args, i)?.to_ascii_uppercase().as_str() {
        "OBJECT" => {
            let json = tok(args, i + 1)?;
            let geom: Geometry = serde_json::from_str(json)
                .map_err(|e| CommandError::Syntax(format!("invalid OBJECT json: {e}")))?;
            Ok((Value::Geom(geom), i + 2))
        }
        "POINT" => {
            let lat = parse_f64(tok(args, i + 1)?)?;
            let lon = parse_f64(tok(args, i + 2)?)?;
            if let Ok(z) = tok(args, i + 3).and_then(parse_f64) {
                Ok((Value::Geom(Geometry::Point { lat, lon, z: Some(z) }), i + 4))
            } else {
                Ok((Value::Geom(Geometry::point(lat, lon)), i + 3))
            }
        }
        "BOUNDS" => {
            let min_lat = parse_f64(tok(args, i + 1)?)?;
            let min_lon = parse_f64(tok(args, i + 2)?)?;
            let max_lat = parse_f64(tok(args, i + 3)?)?;
            let max_lon = parse_f64(tok(args, i + 4)?)?;
            Ok((
                Value::Geom(Geometry::Rect { min_lat, min_lon, max_lat, max_lon }),
                i + 5,
            ))
        }
        "STRING" => Ok((Value::Str(tok(args, i + 1)?.to_string()), i + 2)),
        other => Err(CommandError::Syntax(format!("unknown value form {other}"))),
    }
}

/// Parse `CIRCLE lat lon meters | OBJECT json | BOUNDS ... | POINT lat lon |
/// HASH gh | TILE x y z | QUADKEY k | GET key id` used by NEARBY/WITHIN/
/// INTERSECTS area arguments. `GET` defers resolution to the dispatcher,
/// which is the only layer with store access; every other form resolves to
/// a literal geometry immediately.
fn parse_area(args: &[String], i: usize) -> CommandResult<(AreaSpec, usize)> {
    match tok(args, i)?.to_ascii_uppercase().as_str() {
        "CIRCLE" => {
            let lat = parse_f64(tok(args, i + 1)?)?;
            let lon = parse_f64(tok(args, i + 2)?)?;
            let meters = parse_f64(tok(args, i + 3)?)?;
            Ok((AreaSpec::Literal(Geometry::Circle { lat, lon, meters }), i + 4))
        }
        "POINT" => {
            let lat = parse_f64(tok(args, i + 1)?)?;
            let lon = parse_f64(tok(args, i + 2)?)?;
            if let Ok(meters) = tok(args, i + 3).and_then(parse_f64) {
                Ok((AreaSpec::Literal(Geometry::Circle { lat, lon, meters }), i + 4))
            } else {
                Ok((AreaSpec::Literal(Geometry::point(lat, lon)), i + 3))
            }
        }
        "OBJECT" => {
            let json = tok(args, i + 1)?;
            let geom: Geometry = serde_json::from_str(json)
                .map_err(|e| CommandError::Syntax(format!("invalid OBJECT json: {e}")))?;
            Ok((AreaSpec::Literal(geom), i + 2))
        }
        "BOUNDS" => {
            let min_lat = parse_f64(tok(args, i + 1)?)?;
            let min_lon = parse_f64(tok(args, i + 2)?)?;
            let max_lat = parse_f64(tok(args, i + 3)?)?;
            let max_lon = parse_f64(tok(args, i + 4)?)?;
            Ok((AreaSpec::Literal(Geometry::Rect { min_lat, min_lon, max_lat, max_lon }), i + 5))
        }
        "HASH" => {
            let gh = tok(args, i + 1)?;
            let rect = crate::geometry::geohash::decode(gh)
                .ok_or_else(|| CommandError::Syntax(format!("invalid geohash {gh}")))?;
            Ok((
                AreaSpec::Literal(Geometry::Rect {
                    min_lat: rect.min_lat,
                    min_lon: rect.min_lon,
                    max_lat: rect.max_lat,
                    max_lon: rect.max_lon,
                }),
                i + 2,
            ))
        }
        "TILE" => {
            let x: u32 = tok(args, i + 1)?.parse().map_err(|_| CommandError::Syntax("bad tile x".into()))?;
            let y: u32 = tok(args, i + 2)?.parse().map_err(|_| CommandError::Syntax("bad tile y".into()))?;
            let z: u8 = tok(args, i + 3)?.parse().map_err(|_| CommandError::Syntax("bad tile z".into()))?;
            let rect = crate::geometry::tile_bounds(x, y, z);
            Ok((
                AreaSpec::Literal(Geometry::Rect {
                    min_lat: rect.min_lat,
                    min_lon: rect.min_lon,
                    max_lat: rect.max_lat,
                    max_lon: rect.max_lon,
                }),
                i + 4,
            ))
        }
        "QUADKEY" => {
            let key = tok(args, i + 1)?;
            let (x, y, z) = crate::geometry::quadkey_to_tile(key)
                .ok_or_else(|| CommandError::Syntax(format!("invalid quadkey {key}")))?;
            let rect = crate::geometry::tile_bounds(x, y, z);
            Ok((
                AreaSpec::Literal(Geometry::Rect {
                    min_lat: rect.min_lat,
                    min_lon: rect.min_lon,
                    max_lat: rect.max_lat,
                    max_lon: rect.max_lon,
                }),
                i + 2,
            ))
        }
        "GET" => {
            let key = tok(args, i + 1)?.to_string();
            let id = tok(args, i + 2)?.to_string();
            Ok((AreaSpec::Ref { key, id }, i + 3))
        }
        other => Err(CommandError::Syntax(format!("unknown area form {other}"))),
    }
}

fn parse_detect_list(s: &str) -> CommandResult<Vec<Detect>> {
    s.split(',')
        .map(|d| match d.trim().to_ascii_lowercase().as_str() {
            "inside" => Ok(Detect::Inside),
            "outside" => Ok(Detect::Outside),
            "enter" => Ok(Detect::Enter),
            "exit" => Ok(Detect::Exit),
            "cross" => Ok(Detect::Cross),
            "roam" => Ok(Detect::Roam),
            other => Err(CommandError::Syntax(format!("unknown detect value {other}"))),
        })
        .collect()
}

/// Parse the common read-query modifiers (`CURSOR`, `LIMIT`, `MATCH`,
/// `ASC`/`DESC`, `WHERE`, `WHEREIN`, `NOFIELDS`, output shape) starting
/// right after `key`.
fn parse_scan_modifiers(args: &[String], mut i: usize, key: String) -> CommandResult<ScanArgs> {
    let mut scan = ScanArgs {
        key,
        cursor: 0,
        limit: None,
        matches: None,
        reverse: false,
        wheres: vec![],
        whereins: vec![],
        nofields: false,
        output: OutputMode::Object,
    };
    while i < args.len() {
        match args[i].to_ascii_uppercase().as_str() {
            "CURSOR" => {
                scan.cursor = tok(args, i + 1)?.parse().map_err(|_| CommandError::Syntax("bad CURSOR".into()))?;
                i += 2;
            }
            "LIMIT" => {
                scan.limit = Some(tok(args, i + 1)?.parse().map_err(|_| CommandError::Syntax("bad LIMIT".into()))?);
                i += 2;
            }
            "MATCH" => {
                scan.matches = Some(tok(args, i + 1)?.to_string());
                i += 2;
            }
            "ASC" => {
                scan.reverse = false;
                i += 1;
            }
            "DESC" => {
                scan.reverse = true;
                i += 1;
            }
            "WHERE" => {
                let field = tok(args, i + 1)?.to_string();
                let min = parse_f64(tok(args, i + 2)?)?;
                let max = parse_f64(tok(args, i + 3)?)?;
                scan.wheres.push(WhereClause { field, min, max });
                i += 4;
            }
            "WHEREIN" => {
                let field = tok(args, i + 1)?.to_string();
                let count: usize = tok(args, i + 2)?.parse().map_err(|_| CommandError::Syntax("bad WHEREIN count".into()))?;
                let mut values = Vec::with_capacity(count);
                for k in 0..count {
                    values.push(parse_f64(tok(args, i + 3 + k)?)?);
                }
                scan.whereins.push(WhereInClause { field, values });
                i += 3 + count;
            }
            "NOFIELDS" => {
                scan.nofields = true;
                i += 1;
            }
            "IDS" => {
                scan.output = OutputMode::Ids;
                i += 1;
            }
            "POINTS" => {
                scan.output = OutputMode::Point;
                i += 1;
            }
            "BOUNDS" => {
                scan.output = OutputMode::Bounds;
                i += 1;
            }
            "COUNT" => {
                scan.output = OutputMode::Count;
                i += 1;
            }
            "OBJECTS" => {
                scan.output = OutputMode::Object;
                i += 1;
            }
            "HASHES" => {
                let precision: u8 = tok(args, i + 1)?.parse().map_err(|_| CommandError::Syntax("bad precision".into()))?;
                scan.output = OutputMode::Hash(precision);
                i += 2;
            }
            other => return Err(CommandError::Syntax(format!("unexpected token {other}"))),
        }
    }
    Ok(scan)
}

/// Parse a full `SETHOOK`/`SETCHAN` fence-command tail:
/// `<NEARBY|WITHIN|INTERSECTS> key FENCE [DETECT d,d] [COMMANDS c,c] <area> [modifiers]`
/// (spec §6.2 scenario: `NEARBY fleet FENCE DETECT enter,exit POINT 33.55 -112.1 5000`), or
/// `ROAM key FENCE [DETECT d,d] [COMMANDS c,c] radius [ID pattern] [NODWELL]` for a roaming
/// fence, which has no area of its own — it tracks neighbors of the moving object itself.
fn parse_fence_tail(args: &[String], i: usize) -> CommandResult<FenceArgs> {
    let kind_word = tok(args, i)?.to_ascii_uppercase();
    let key = tok(args, i + 1)?.to_string();
    let mut j = i + 2;
    if args.get(j).map(|s| s.eq_ignore_ascii_case("FENCE")).unwrap_or(false) {
        j += 1;
    }
    let mut detect = vec![Detect::Inside, Detect::Enter, Detect::Exit, Detect::Cross];
    let mut commands = None;
    loop {
        match tok(args, j)?.to_ascii_uppercase().as_str() {
            "DETECT" => {
                detect = parse_detect_list(tok(args, j + 1)?)?;
                j += 2;
            }
            "COMMANDS" => {
                commands = Some(tok(args, j + 1)?.split(',').map(|s| s.trim().to_ascii_lowercase()).collect());
                j += 2;
            }
            _ => break,
        }
    }
    if kind_word == "ROAM" {
        let (roam, next) = parse_roam(args, j.saturating_sub(1))?;
        let base = parse_scan_modifiers(args, next, key)?;
        let search = SearchArgs { base, geometry_kind: SearchKind::Scan };
        return Ok(FenceArgs { search, detect, commands, roam: Some(roam) });
    }
    let mut tail = vec![kind_word];
    tail.extend(args[j..].iter().cloned());
    let search = parse_search(&tail, 0, key)?;
    Ok(FenceArgs { search, detect, commands, roam: None })
}

fn parse_search(args: &[String], i: usize, key: String) -> CommandResult<SearchArgs> {
    if i >= args.len() {
        let base = parse_scan_modifiers(args, i, key)?;
        return Ok(SearchArgs { base, geometry_kind: SearchKind::Scan });
    }
    match args[i].to_ascii_uppercase().as_str() {
        "NEARBY" => {
            let (origin, next) = parse_area(args, i + 1)?;
            let base = parse_scan_modifiers(args, next, key)?;
            Ok(SearchArgs { base, geometry_kind: SearchKind::Nearby { origin } })
        }
        "WITHIN" => {
            let (area, next) = parse_area(args, i + 1)?;
            let base = parse_scan_modifiers(args, next, key)?;
            Ok(SearchArgs { base, geometry_kind: SearchKind::Within { area } })
        }
        "INTERSECTS" => {
            let mut j = i + 1;
            let clip = if args.get(j).map(|s| s.eq_ignore_ascii_case("CLIP")).unwrap_or(false) {
                j += 1;
                true
            } else {
                false
            };
            let (area, next) = parse_area(args, j)?;
            let base = parse_scan_modifiers(args, next, key)?;
            Ok(SearchArgs { base, geometry_kind: SearchKind::Intersects { area, clip } })
        }
        _ => {
            let base = parse_scan_modifiers(args, i, key)?;
            Ok(SearchArgs { base, geometry_kind: SearchKind::Scan })
        }
    }
}

/// Parse a whitespace-tokenized native frame into a [`Command`]. JSON
/// payloads (e.g. `SET key id OBJECT {"type":"Point",...}`) are expected to
/// already be a single token — the frame reader is responsible for keeping
/// braced JSON intact (matches the teacher's length-prefixed framing in
/// `socket_server.rs`, which delivers one opaque payload per message rather
/// than doing shell-style tokenizing itself).
pub fn parse_frame(args: Vec<String>) -> CommandResult<Command> {
    if args.is_empty() {
        return Err(CommandError::Syntax("empty command".into()));
    }
    let name = args[0].to_ascii_uppercase();
    let rest = &args[1..];
    match name.as_str() {
        "PING" => Ok(Command::Ping),
        "QUIT" => Ok(Command::Quit),
        "FLUSHDB" => Ok(Command::FlushDb),
        "AOFSHRINK" => Ok(Command::AofShrink),
        "AUTH" => Ok(Command::Auth { password: tok(rest, 0)?.to_string() }),
        "OUTPUT" => match tok(rest, 0)?.to_ascii_uppercase().as_str() {
            "JSON" => Ok(Command::Output(OutputFormat::Json)),
            "RESP" => Ok(Command::Output(OutputFormat::Resp)),
            other => Err(CommandError::Syntax(format!("unknown OUTPUT mode {other}"))),
        },
        "READONLY" => match tok(rest, 0)?.to_ascii_lowercase().as_str() {
            "yes" => Ok(Command::ReadOnly(true)),
            "no" => Ok(Command::ReadOnly(false)),
            other => Err(CommandError::Syntax(format!("expected yes|no, got {other}"))),
        },
        "FOLLOW" => {
            if tok(rest, 0)?.eq_ignore_ascii_case("no") {
                Ok(Command::Follow { host: None })
            } else {
                let host = tok(rest, 0)?.to_string();
                let port: u16 = tok(rest, 1)?.parse().map_err(|_| CommandError::Syntax("bad port".into()))?;
                Ok(Command::Follow { host: Some((host, port)) })
            }
        }
        "AOF" => Ok(Command::Aof { pos: tok(rest, 0)?.parse().map_err(|_| CommandError::Syntax("bad pos".into()))? }),
        "AOFMD5" => Ok(Command::AofMd5 {
            pos: tok(rest, 0)?.parse().map_err(|_| CommandError::Syntax("bad pos".into()))?,
            size: tok(rest, 1)?.parse().map_err(|_| CommandError::Syntax("bad size".into()))?,
        }),
        "CONFIG" => match tok(rest, 0)?.to_ascii_uppercase().as_str() {
            "GET" => Ok(Command::Config { action: ConfigAction::Get(tok(rest, 1)?.to_string()) }),
            "SET" => Ok(Command::Config {
                action: ConfigAction::Set(tok(rest, 1)?.to_string(), tok(rest, 2)?.to_string()),
            }),
            "REWRITE" => Ok(Command::Config { action: ConfigAction::Rewrite }),
            other => Err(CommandError::Syntax(format!("unknown CONFIG action {other}"))),
        },
        "SUBSCRIBE" => Ok(Command::Subscribe { channels: rest.to_vec() }),
        "PSUBSCRIBE" => Ok(Command::Psubscribe { patterns: rest.to_vec() }),
        "PUBLISH" => Ok(Command::Publish { channel: tok(rest, 0)?.to_string(), message: tok(rest, 1)?.to_string() }),
        "KEYS" => Ok(Command::Keys { pattern: tok(rest, 0)?.to_string() }),
        "HOOKS" => Ok(Command::Hooks { pattern: tok(rest, 0)?.to_string() }),
        "DELHOOK" => Ok(Command::DelHook { name: tok(rest, 0)?.to_string() }),
        "PDELHOOK" => Ok(Command::PdelHook { pattern: tok(rest, 0)?.to_string() }),
        "DROP" => Ok(Command::Drop { key: tok(rest, 0)?.to_string() }),
        "BOUNDS" => Ok(Command::Bounds { key: tok(rest, 0)?.to_string() }),
        "TYPE" => Ok(Command::Type { key: tok(rest, 0)?.to_string() }),
        "STATS" => Ok(Command::Stats { keys: rest.to_vec() }),
        "TTL" => Ok(Command::Ttl { key: tok(rest, 0)?.to_string(), id: tok(rest, 1)?.to_string() }),
        "PERSIST" => Ok(Command::Persist { key: tok(rest, 0)?.to_string(), id: tok(rest, 1)?.to_string() }),
        "EXPIRE" => Ok(Command::Expire {
            key: tok(rest, 0)?.to_string(),
            id: tok(rest, 1)?.to_string(),
            seconds: parse_f64(tok(rest, 2)?)?,
        }),
        "PDEL" => Ok(Command::Pdel { key: tok(rest, 0)?.to_string(), pattern: tok(rest, 1)?.to_string() }),
        "RENAME" | "RENAMENX" => Ok(Command::Rename {
            key: tok(rest, 0)?.to_string(),
            new_key: tok(rest, 1)?.to_string(),
            nx: name == "RENAMENX",
        }),
        "DEL" => {
            let key = tok(rest, 0)?.to_string();
            let id = tok(rest, 1)?.to_string();
            let erron404 = rest.get(2).map(|s| s.eq_ignore_ascii_case("ERRON404")).unwrap_or(false);
            Ok(Command::Del { key, id, erron404 })
        }
        "GET" => {
            let key = tok(rest, 0)?.to_string();
            let id = tok(rest, 1)?.to_string();
            let withfields = rest.iter().any(|s| s.eq_ignore_ascii_case("WITHFIELDS"));
            let mut output = OutputMode::Object;
            let mut i = 2;
            while let Some(word) = rest.get(i) {
                match word.to_ascii_uppercase().as_str() {
                    "POINT" => output = OutputMode::Point,
                    "OBJECT" => output = OutputMode::Object,
                    "BOUNDS" => output = OutputMode::Bounds,
                    "HASH" => {
                        let precision: u8 = tok(rest, i + 1)?.parse().map_err(|_| CommandError::Syntax("bad precision".into()))?;
                        output = OutputMode::Hash(precision);
                        i += 1;
                    }
                    "WITHFIELDS" => {}
                    _ => {}
                }
                i += 1;
            }
            Ok(Command::Get { key, id, withfields, output })
        }
        "FSET" => {
            let key = tok(rest, 0)?.to_string();
            let mut i = 1;
            let xx = rest.get(1).map(|s| s.eq_ignore_ascii_case("XX")).unwrap_or(false);
            if xx {
                i += 1;
            }
            let id = tok(rest, i)?.to_string();
            i += 1;
            let mut fields = Vec::new();
            while i + 1 < rest.len() {
                let fname = rest[i].to_ascii_lowercase();
                validate_field_name(&fname)?;
                fields.push((fname, parse_field_value(&rest[i + 1])));
                i += 2;
            }
            Ok(Command::Fset { key, id, xx, fields })
        }
        "SET" => {
            let key = tok(rest, 0)?.to_string();
            let id = tok(rest, 1)?.to_string();
            let mut i = 2;
            let mut fields = Vec::new();
            let mut ex = None;
            let mut nx_xx = NxXx::None;
            loop {
                match tok(rest, i)?.to_ascii_uppercase().as_str() {
                    "FIELD" => {
                        let fname = tok(rest, i + 1)?.to_ascii_lowercase();
                        validate_field_name(&fname)?;
                        fields.push((fname, parse_field_value(tok(rest, i + 2)?)));
                        i += 3;
                    }
                    "EX" => {
                        ex = Some(parse_f64(tok(rest, i + 1)?)?);
                        i += 2;
                    }
                    "NX" => {
                        nx_xx = NxXx::Nx;
                        i += 1;
                    }
                    "XX" => {
                        nx_xx = NxXx::Xx;
                        i += 1;
                    }
                    _ => break,
                }
            }
            let (value, _) = parse_value(rest, i)?;
            Ok(Command::Set(SetArgs { key, id, fields, ex, nx_xx, value }))
        }
        "SCAN" => {
            let key = tok(rest, 0)?.to_string();
            Ok(Command::Scan(parse_search(rest, 1, key)?))
        }
        "SEARCH" => {
            let key = tok(rest, 0)?.to_string();
            let base = parse_scan_modifiers(rest, 1, key)?;
            Ok(Command::Scan(SearchArgs { base, geometry_kind: SearchKind::Scan }))
        }
        "NEARBY" | "WITHIN" | "INTERSECTS" => {
            let key = tok(rest, 0)?.to_string();
            let mut tail = vec![name.clone()];
            tail.extend(rest.iter().skip(1).cloned());
            Ok(Command::Scan(parse_search(&tail, 0, key)?))
        }
        "SETHOOK" => {
            let hook_name = tok(rest, 0)?.to_string();
            let mut endpoints = Vec::new();
            let mut i = 1;
            while i < rest.len() && !is_fence_tail_token(&rest[i]) {
                endpoints.push(rest[i].clone());
                i += 1;
            }
            if endpoints.is_empty() {
                return Err(CommandError::Syntax("SETHOOK requires at least one endpoint".into()));
            }
            let fence = parse_fence_tail(rest, i)?;
            Ok(Command::SetHook { name: hook_name, endpoints, fence })
        }
        "SETCHAN" => {
            let hook_name = tok(rest, 0)?.to_string();
            let fence = parse_fence_tail(rest, 1)?;
            Ok(Command::SetChan {
                name: hook_name.clone(),
                channel: hook_name,
                fence,
            })
        }
        "CLIENT" => Ok(Command::Client { args: rest.to_vec() }),
        "REPLCONF" => Ok(Command::Replconf),
        "INFO" => Ok(Command::Info),
        "SERVER" => Ok(Command::Server),
        "CHANS" => Ok(Command::Chans { pattern: rest.first().cloned().unwrap_or_else(|| "*".to_string()) }),
        "JGET" => {
            let key = tok(rest, 0)?.to_string();
            let id = tok(rest, 1)?.to_string();
            let path = tok(rest, 2)?.to_string();
            let raw = rest.get(3).map(|s| s.eq_ignore_ascii_case("RAW")).unwrap_or(false);
            Ok(Command::Jget { key, id, path, raw })
        }
        "JSET" => {
            let key = tok(rest, 0)?.to_string();
            let id = tok(rest, 1)?.to_string();
            let path = tok(rest, 2)?.to_string();
            let value = tok(rest, 3)?.to_string();
            let raw = rest.get(4).map(|s| s.eq_ignore_ascii_case("RAW")).unwrap_or(false);
            Ok(Command::Jset { key, id, path, value, raw })
        }
        "JDEL" => {
            let key = tok(rest, 0)?.to_string();
            let id = tok(rest, 1)?.to_string();
            let path = tok(rest, 2)?.to_string();
            Ok(Command::Jdel { key, id, path })
        }
        other => Err(CommandError::Syntax(format!("unknown command {other}"))),
    }
}

fn is_fence_tail_token(tok: &str) -> bool {
    matches!(tok.to_ascii_uppercase().as_str(), "NEARBY" | "WITHIN" | "INTERSECTS" | "SCAN" | "ROAM")
}

fn validate_field_name(name: &str) -> CommandResult<()> {
    if is_reserved_field(name) || !FIELD_NAME.is_match(name) {
        return Err(CommandError::Syntax(format!("invalid field name {name}")));
    }
    Ok(())
}

fn parse_field_value(s: &str) -> FieldValue {
    if let Ok(n) = s.parse::<f64>() {
        FieldValue::Num(n)
    } else if s.eq_ignore_ascii_case("true") {
        FieldValue::Bool(true)
    } else if s.eq_ignore_ascii_case("false") {
        FieldValue::Bool(false)
    } else {
        FieldValue::Str(s.to_string())
    }
}

/// Convert a roam fence's dedicated syntax, `ROAM radius [ID pattern] [NODWELL]`,
/// captured as part of an area parse. Kept separate since roam fences don't
/// carry a geometry kind the way WITHIN/INTERSECTS/NEARBY do.
pub fn parse_roam(args: &[String], i: usize) -> CommandResult<(RoamSpec, usize)> {
    let radius_meters = parse_f64(tok(args, i + 1)?)?;
    let mut j = i + 2;
    let mut id_pattern = None;
    let mut nodwell = false;
    while j < args.len() {
        match args[j].to_ascii_uppercase().as_str() {
            "ID" => {
                id_pattern = Some(tok(args, j + 1)?.to_string());
                j += 2;
            }
            "NODWELL" => {
                nodwell = true;
                j += 1;
            }
            _ => break,
        }
    }
    Ok((RoamSpec { radius_meters, id_pattern, nodwell }, j))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_point() {
        let args = vec!["SET", "fleet", "truck1", "POINT", "33.5", "-112.1"]
            .into_iter()
            .map(String::from)
            .collect();
        match parse_frame(args).unwrap() {
            Command::Set(s) => {
                assert_eq!(s.key, "fleet");
                assert_eq!(s.id, "truck1");
            }
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn parses_pdel() {
        let args = vec!["PDEL", "fleet", "t*"].into_iter().map(String::from).collect();
        match parse_frame(args).unwrap() {
            Command::Pdel { key, pattern } => {
                assert_eq!(key, "fleet");
                assert_eq!(pattern, "t*");
            }
            _ => panic!("expected Pdel"),
        }
    }

    #[test]
    fn glob_prefix_bounds_half_open() {
        let (lo, hi) = glob_prefix_bounds("t*").unwrap();
        assert_eq!(lo, "t");
        assert_eq!(hi, "u");
    }

    #[test]
    fn glob_matches_star() {
        let re = glob_to_regex("t*");
        assert!(re.is_match("t1"));
        assert!(!re.is_match("x1"));
    }
}
