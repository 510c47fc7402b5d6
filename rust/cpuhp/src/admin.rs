// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Administrative interface
//!
//! Line-delimited JSON over a UNIX stream socket. Each request is
//!
//! ```json
//! {"req": "request", "args": {"name": "SYSFS", "mask": "0x0f"}}
//! ```
//!
//! and is answered by
//!
//! ```json
//! {"errno": 0, "args": {"resp": ...}}
//! ```
//!
//! where a non-zero errno carries the error text in `resp`.
//!
//! | req          | args           | effect                                  |
//! |--------------|----------------|-----------------------------------------|
//! | `status`     |                | engine status                           |
//! | `clients`    |                | registered clients and their masks      |
//! | `enable`     | `value` (0/1)  | enable or disable arbitration           |
//! | `request`    | `name`, `mask` | update a client's mask                  |
//! | `register`   | `name`, `mask` | register a new client                   |
//! | `unregister` | `name`         | accepted, has no effect                 |
//! | `suspend`    |                | defer reconciliation                    |
//! | `resume`     |                | resume and reconcile                    |
//! | `qos_max`    | `value`        | limit online CPUs to `[0, value)`       |
//! | `qos_min`    | `value`        | accepted, has no effect                 |

use crate::engine::RequestOutcome;
use crate::registry::ClientId;
use crate::registry::ClientKind;
use crate::registry::RegistryError;
use crate::Cpumask;
use crate::Engine;
use crate::HotplugOps;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::spawn;

pub const ADMIN_SOCKET_PATH: &str = "/var/run/cpuhp/admin";

// Maximum length of one request line (64 KB)
const MAX_REQUEST_LEN: u64 = 64 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminRequest {
    pub req: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl AdminRequest {
    pub fn new(req: &str, args: Vec<(String, String)>) -> Self {
        Self {
            req: req.to_string(),
            args: args.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminResponse {
    pub errno: i32,
    pub args: BTreeMap<String, Value>,
}

pub struct AdminErrno(pub i32);

impl std::fmt::Display for AdminErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.0))
    }
}

impl std::fmt::Debug for AdminErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", std::io::Error::from_raw_os_error(self.0))
    }
}

fn errno_of(e: &anyhow::Error) -> i32 {
    if let Some(errno) = e.downcast_ref::<AdminErrno>() {
        if errno.0 != 0 {
            return errno.0;
        }
    }
    match e.downcast_ref::<RegistryError>() {
        Some(RegistryError::AlreadyRegistered(_)) => libc::EEXIST,
        Some(RegistryError::UnknownClient(_)) => libc::ENOENT,
        _ => libc::EINVAL,
    }
}

fn arg<'a>(req: &'a AdminRequest, key: &str) -> Result<&'a str> {
    match req.args.get(key) {
        Some(v) => Ok(v.as_str()),
        None => Err(anyhow!("{:?} requires argument {:?}", req.req, key)
            .context(AdminErrno(libc::EINVAL))),
    }
}

fn arg_usize(req: &AdminRequest, key: &str) -> Result<usize> {
    let v = arg(req, key)?;
    v.trim()
        .parse::<usize>()
        .map_err(|e| anyhow!("invalid {key} {v:?} ({e})").context(AdminErrno(libc::EINVAL)))
}

fn arg_bool(req: &AdminRequest, key: &str) -> Result<bool> {
    match arg(req, key)?.trim() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        v => Err(anyhow!("invalid {key} {v:?}, expected 0 or 1")
            .context(AdminErrno(libc::EINVAL))),
    }
}

/// Parse the `mask` argument and refuse masks which would leave the
/// resolved target empty or without the boot CPU.
fn arg_mask<O: HotplugOps>(
    engine: &Engine<O>,
    req: &AdminRequest,
    id: &ClientId,
) -> Result<Cpumask> {
    let mask = engine
        .parse_mask(arg(req, "mask")?)
        .map_err(|e| e.context(AdminErrno(libc::EINVAL)))?;
    engine
        .check_mask(id, &mask)
        .map_err(|e| e.context(AdminErrno(libc::EINVAL)))?;
    Ok(mask)
}

fn request_json(name: &str, outcome: RequestOutcome) -> Result<Value> {
    Ok(match outcome {
        RequestOutcome::UnknownClient => json!({ "client": name, "known": false }),
        RequestOutcome::Reconciled(r) => {
            json!({ "client": name, "known": true, "reconcile": serde_json::to_value(r)? })
        }
    })
}

/// Execute one administrative request against `engine`.
pub fn handle_request<O: HotplugOps>(engine: &Engine<O>, req: &AdminRequest) -> Result<Value> {
    debug!("admin request {:?} {:?}", req.req, req.args);

    match req.req.as_str() {
        "status" => Ok(serde_json::to_value(engine.status())?),
        "clients" => Ok(serde_json::to_value(engine.clients())?),
        "enable" => {
            let enable = arg_bool(req, "value")?;
            let res = engine
                .set_enabled(enable)
                .map_err(|e| e.context(AdminErrno(libc::EIO)))?;
            Ok(serde_json::to_value(res)?)
        }
        "request" => {
            let name = arg(req, "name")?;
            let id = ClientId::parse(name)?;
            let mask = arg_mask(engine, req, &id)?;
            request_json(name, engine.request(&id, mask)?)
        }
        "register" => {
            let name = arg(req, "name")?;
            let id = ClientId::parse(name)?;
            let mask = arg_mask(engine, req, &id)?;
            let kind = match id.is_builtin() {
                true => ClientKind::Internal,
                false => ClientKind::Registered,
            };
            let res = engine.register_client(id, mask, kind)?;
            Ok(json!({ "client": name, "reconcile": serde_json::to_value(res)? }))
        }
        "unregister" => {
            let name = arg(req, "name")?;
            engine.unregister_client(&ClientId::parse(name)?)?;
            Ok(json!({ "client": name }))
        }
        "suspend" => {
            engine.on_suspend_prepare();
            Ok(json!({ "suspended": true }))
        }
        "resume" => Ok(serde_json::to_value(engine.on_post_resume())?),
        "qos_max" => {
            let value = arg_usize(req, "value")?;
            request_json(ClientId::Qos.name(), engine.on_qos_max_changed(value)?)
        }
        "qos_min" => {
            engine.on_qos_min_changed(arg_usize(req, "value")?);
            Ok(Value::Null)
        }
        other => Err(anyhow!("unknown command {:?}", other).context(AdminErrno(libc::EINVAL))),
    }
}

fn build_resp<T: Serialize>(errno: i32, resp: &T) -> Result<AdminResponse> {
    Ok(AdminResponse {
        errno,
        args: [("resp".into(), serde_json::to_value(resp)?)]
            .into_iter()
            .collect(),
    })
}

/// Read one request line into `line`, at most [`MAX_REQUEST_LEN`] bytes.
/// Returns false at end of stream.
fn read_request<R: BufRead>(reader: &mut R, line: &mut String) -> Result<bool> {
    let len = reader.take(MAX_REQUEST_LEN).read_line(line)?;
    if len == 0 {
        return Ok(false);
    }
    if !line.ends_with('\n') && len as u64 >= MAX_REQUEST_LEN {
        bail!("admin request exceeds {} bytes", MAX_REQUEST_LEN);
    }
    Ok(true)
}

/// Answer one request line, turning failures into an errno response.
pub fn respond<O: HotplugOps>(engine: &Engine<O>, line: &str) -> Result<AdminResponse> {
    let result = serde_json::from_str::<AdminRequest>(line)
        .map_err(|e| anyhow!(e).context(AdminErrno(libc::EINVAL)))
        .and_then(|req| handle_request(engine, &req));

    match result {
        Ok(v) => build_resp(0, &v),
        Err(e) => {
            let errno = errno_of(&e);
            build_resp(errno, &format!("{e:#}"))
        }
    }
}

pub struct AdminServer<O>
where
    O: HotplugOps + 'static,
{
    path: PathBuf,
    engine: Arc<Engine<O>>,
    exit: Arc<AtomicBool>,
    launched: bool,
}

impl<O> AdminServer<O>
where
    O: HotplugOps + 'static,
{
    pub fn new(engine: Arc<Engine<O>>) -> Self {
        Self {
            path: PathBuf::from(ADMIN_SOCKET_PATH),
            engine,
            exit: Arc::new(AtomicBool::new(false)),
            launched: false,
        }
    }

    pub fn set_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = PathBuf::from(path.as_ref());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn launch(mut self) -> Result<Self> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {:?}", dir))?;
        }

        let res = std::fs::remove_file(&self.path);
        if let Err(e) = &res {
            if e.kind() != std::io::ErrorKind::NotFound {
                res.with_context(|| format!("deleting {:?}", &self.path))?;
            }
        }

        let listener = UnixListener::bind(&self.path)
            .with_context(|| format!("creating UNIX socket {:?}", &self.path))?;
        info!("admin socket listening on {:?}", &self.path);

        let engine = self.engine.clone();
        let exit = self.exit.clone();
        spawn(move || Self::listen(listener, engine, exit));
        self.launched = true;
        Ok(self)
    }

    fn listen(listener: UnixListener, engine: Arc<Engine<O>>, exit: Arc<AtomicBool>) {
        for stream in listener.incoming() {
            if exit.load(Ordering::Relaxed) {
                debug!("admin listener exiting");
                break;
            }
            match stream {
                Ok(stream) => {
                    let engine = engine.clone();
                    let exit = exit.clone();
                    spawn(move || {
                        if let Err(e) = Self::serve(stream, &engine, &exit) {
                            warn!("admin connection errored ({})", &e);
                        }
                    });
                }
                Err(e) => warn!("failed to accept admin connection ({})", &e),
            }
        }
    }

    fn serve(mut stream: UnixStream, engine: &Engine<O>, exit: &AtomicBool) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);

        loop {
            let mut line = String::new();
            if !read_request(&mut reader, &mut line)? {
                return Ok(());
            }
            if exit.load(Ordering::Relaxed) {
                debug!("admin connection exiting");
                return Ok(());
            }

            let resp = respond(engine, &line)?;
            let output = serde_json::to_string(&resp)? + "\n";
            stream.write_all(output.as_bytes())?;
        }
    }
}

impl<O> Drop for AdminServer<O>
where
    O: HotplugOps + 'static,
{
    fn drop(&mut self) {
        if !self.launched {
            return;
        }
        self.exit.store(true, Ordering::Relaxed);
        // Wake up the listener so that it notices the exit flag.
        let _ = UnixStream::connect(&self.path);
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct AdminClient {
    path: PathBuf,
    stream: Option<UnixStream>,
    reader: Option<BufReader<UnixStream>>,
}

impl AdminClient {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(ADMIN_SOCKET_PATH),
            stream: None,
            reader: None,
        }
    }

    pub fn set_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = PathBuf::from(path.as_ref());
        self
    }

    pub fn connect(mut self) -> Result<Self> {
        let stream = UnixStream::connect(&self.path)
            .with_context(|| format!("connecting to {:?}", &self.path))?;
        self.stream = Some(stream.try_clone()?);
        self.reader = Some(BufReader::new(stream));
        Ok(self)
    }

    pub fn send_request(&mut self, req: &AdminRequest) -> Result<Value> {
        let (stream, reader) = match (self.stream.as_mut(), self.reader.as_mut()) {
            (Some(s), Some(r)) => (s, r),
            _ => bail!("not connected"),
        };

        let req = serde_json::to_string(req)? + "\n";
        stream.write_all(req.as_bytes())?;

        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.is_empty() {
            bail!("connection closed by cpuhpd");
        }
        let mut resp: AdminResponse = serde_json::from_str(&line)?;

        let (errno, resp) = (
            resp.errno,
            resp.args.remove("resp").unwrap_or(Value::Null),
        );

        if errno != 0 {
            let msg = match resp {
                Value::String(s) => s,
                v => v.to_string(),
            };
            return Err(anyhow!("{}", msg).context(AdminErrno(errno)));
        }

        Ok(resp)
    }

    pub fn request(&mut self, req: &str, args: Vec<(String, String)>) -> Result<Value> {
        self.send_request(&AdminRequest::new(req, args))
    }
}

impl Default for AdminClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHotplug;
    use crate::fake::HotplugCall::Down;
    use tempfile::TempDir;

    fn engine() -> Engine<FakeHotplug> {
        let engine = Engine::new(FakeHotplug::new(8, &Cpumask::full(8))).unwrap();
        engine.set_enabled(true).unwrap();
        engine
    }

    fn req(cmd: &str, args: &[(&str, &str)]) -> AdminRequest {
        AdminRequest::new(
            cmd,
            args.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_request_command() {
        let engine = engine();
        let v = handle_request(&engine, &req("request", &[("name", "SYSFS"), ("mask", "0x3f")]))
            .unwrap();
        assert_eq!(v["known"], json!(true));
        assert_eq!(v["reconcile"]["state"], json!("applied"));
        assert_eq!(v["reconcile"]["online"], json!("3f"));
        assert_eq!(engine.ops().calls(), vec![Down(7), Down(6)]);
    }

    #[test]
    fn test_request_unknown_client() {
        let engine = engine();
        let v = handle_request(&engine, &req("request", &[("name", "ghost"), ("mask", "1")]))
            .unwrap();
        assert_eq!(v["known"], json!(false));
    }

    #[test]
    fn test_clients_listing() {
        let engine = engine();
        handle_request(&engine, &req("register", &[("name", "cam"), ("mask", "0f")])).unwrap();
        let v = handle_request(&engine, &req("clients", &[])).unwrap();
        assert_eq!(
            v,
            json!([
                { "name": "SYSTEM", "kind": "internal", "mask": "ff" },
                { "name": "SYSFS", "kind": "internal", "mask": "ff" },
                { "name": "cam", "kind": "registered", "mask": "0f" },
            ])
        );
    }

    #[test]
    fn test_errnos() {
        let engine = engine();
        let resp = respond(&engine, r#"{"req":"register","args":{"name":"SYSFS","mask":"ff"}}"#)
            .unwrap();
        assert_eq!(resp.errno, libc::EEXIST);

        let resp = respond(&engine, r#"{"req":"request","args":{"name":"SYSFS"}}"#).unwrap();
        assert_eq!(resp.errno, libc::EINVAL);

        let resp = respond(&engine, r#"{"req":"request","args":{"name":"SYSFS","mask":"0x1ff"}}"#)
            .unwrap();
        assert_eq!(resp.errno, libc::EINVAL);

        let resp = respond(&engine, r#"{"req":"bogus"}"#).unwrap();
        assert_eq!(resp.errno, libc::EINVAL);

        let resp = respond(&engine, "not json").unwrap();
        assert_eq!(resp.errno, libc::EINVAL);

        handle_request(&engine, &req("request", &[("name", "SYSFS"), ("mask", "07")])).unwrap();
        engine.ops().fail_cpu(3);
        let resp = respond(&engine, r#"{"req":"enable","args":{"value":"0"}}"#).unwrap();
        assert_eq!(resp.errno, libc::EIO);
        assert!(engine.status().enabled);
    }

    #[test]
    fn test_invalid_resolution_rejected() {
        let engine = engine();
        for mask in ["0xfe", "none", "00"] {
            let line = format!(
                r#"{{"req":"request","args":{{"name":"SYSFS","mask":"{mask}"}}}}"#
            );
            let resp = respond(&engine, &line).unwrap();
            assert_eq!(resp.errno, libc::EINVAL, "mask {mask}");
        }
        let resp = respond(&engine, r#"{"req":"register","args":{"name":"cam","mask":"f0"}}"#)
            .unwrap();
        assert_eq!(resp.errno, libc::EINVAL);

        // Nothing changed and the engine keeps serving requests.
        assert!(engine.ops().calls().is_empty());
        let status = engine.status();
        assert_eq!(status.nr_clients, 2);
        assert_eq!(status.last_applied, Cpumask::full(8));
        let v = handle_request(&engine, &req("request", &[("name", "SYSFS"), ("mask", "0x7f")]))
            .unwrap();
        assert_eq!(v["reconcile"]["online"], json!("7f"));
    }

    #[test]
    fn test_suspend_resume_and_qos() {
        let engine = engine();
        handle_request(&engine, &req("register", &[("name", "HP_QOS"), ("mask", "all")])).unwrap();
        handle_request(&engine, &req("suspend", &[])).unwrap();
        let v = handle_request(&engine, &req("qos_max", &[("value", "4")])).unwrap();
        assert_eq!(v["reconcile"]["state"], json!("suspended"));
        assert!(engine.ops().calls().is_empty());

        let v = handle_request(&engine, &req("resume", &[])).unwrap();
        assert_eq!(v["online"], json!("0f"));
        assert_eq!(
            engine.ops().calls(),
            vec![Down(7), Down(6), Down(5), Down(4)]
        );

        assert_eq!(
            handle_request(&engine, &req("qos_min", &[("value", "2")])).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_read_request_limit() {
        let mut input = std::io::Cursor::new(b"{\"req\":\"status\"}\n".to_vec());
        let mut line = String::new();
        assert!(read_request(&mut input, &mut line).unwrap());
        assert_eq!(line, "{\"req\":\"status\"}\n");
        line.clear();
        assert!(!read_request(&mut input, &mut line).unwrap());

        let big = vec![b'a'; MAX_REQUEST_LEN as usize + 16];
        let mut input = std::io::Cursor::new(big);
        let mut line = String::new();
        assert!(read_request(&mut input, &mut line).is_err());
        assert_eq!(line.len() as u64, MAX_REQUEST_LEN);
    }

    #[test]
    fn test_socket_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("admin");
        let engine = Arc::new(engine());
        let _server = AdminServer::new(engine.clone())
            .set_path(&path)
            .launch()
            .unwrap();

        let mut client = AdminClient::new().set_path(&path).connect().unwrap();
        let status = client.request("status", vec![]).unwrap();
        assert_eq!(status["enabled"], json!(true));
        assert_eq!(status["possible"], json!("ff"));

        client
            .request(
                "request",
                vec![("name".into(), "SYSFS".into()), ("mask".into(), "0x01".into())],
            )
            .unwrap();
        assert_eq!(engine.ops().online_mask().unwrap().to_cpulist(), "0");

        let err = client
            .request("register", vec![("name".into(), "SYSTEM".into()), ("mask".into(), "1".into())])
            .unwrap_err();
        assert_eq!(err.downcast_ref::<AdminErrno>().unwrap().0, libc::EEXIST);
    }
}
