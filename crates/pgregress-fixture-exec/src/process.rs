//! External engine bridge driven over a JSON-lines pipe.
//!
//! The bridge process reads one request object per line on stdin and answers with one
//! response object per line on stdout:
//!
//! ```text
//! -> {"sql":"select 1","role":"postgres","settings":{},"in_transaction":false}
//! <- {"columns":["?column?"],"rows":[["1"]]}
//! -> {"sql":"select nope","role":"postgres","settings":{},"in_transaction":false}
//! <- {"error":{"code":"42703","message":"column \"nope\" does not exist"}}
//! ```
//!
//! End of stream, a broken pipe, or an unparseable response line is a lost connection.
//! Answers arrive in request order, so a reply that shows up after its request timed
//! out is discarded before the next request's reply is read.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::engine::{
    EngineError, EngineFactory, EngineFailure, EngineRows, EngineStatement, SessionContext,
    SqlEngine,
};

#[derive(Serialize)]
struct Request<'a> {
    sql: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    copy_payload: Option<&'a str>,
    role: &'a str,
    settings: &'a BTreeMap<String, String>,
    in_transaction: bool,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    rows: Vec<Vec<Option<String>>>,
    #[serde(default)]
    error: Option<EngineError>,
}

pub struct ProcessEngine {
    child: Child,
    stdin: ChildStdin,
    responses: Receiver<std::io::Result<String>>,
    timeout: Option<Duration>,
    /// Replies still owed for requests that timed out.
    stale: usize,
}

impl ProcessEngine {
    /// Start the bridge process. Its stderr is inherited.
    pub fn spawn(
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<Self, EngineFailure> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| EngineFailure::Connect(format!("{program}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineFailure::Connect(format!("{program}: stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineFailure::Connect(format!("{program}: stdout unavailable")))?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            responses: rx,
            timeout,
            stale: 0,
        })
    }

    fn receive_line(&self, deadline: Option<(Instant, Duration)>) -> Result<String, EngineFailure> {
        let received = match deadline {
            Some((at, limit)) => {
                let left = at.saturating_duration_since(Instant::now());
                self.responses.recv_timeout(left).map_err(|err| match err {
                    RecvTimeoutError::Timeout => EngineFailure::Timeout(limit),
                    RecvTimeoutError::Disconnected => {
                        EngineFailure::ConnectionLost("engine bridge closed stdout".to_string())
                    }
                })?
            }
            None => self.responses.recv().map_err(|_| {
                EngineFailure::ConnectionLost("engine bridge closed stdout".to_string())
            })?,
        };
        received.map_err(|err| EngineFailure::ConnectionLost(err.to_string()))
    }

    /// Read the reply to the request just sent, skipping replies owed to timed-out ones.
    fn receive(&mut self) -> Result<String, EngineFailure> {
        let deadline = self.timeout.map(|limit| (Instant::now() + limit, limit));
        // The current request's reply is owed too until it arrives.
        self.stale += 1;
        loop {
            let line = self.receive_line(deadline)?;
            self.stale -= 1;
            if self.stale == 0 {
                return Ok(line);
            }
        }
    }
}

impl SqlEngine for ProcessEngine {
    fn exec(
        &mut self,
        statement: &EngineStatement,
        ctx: &SessionContext,
    ) -> Result<EngineRows, EngineFailure> {
        let request = Request {
            sql: &statement.sql,
            copy_payload: statement.copy_payload.as_deref(),
            role: &ctx.role,
            settings: &ctx.settings,
            in_transaction: ctx.in_transaction,
        };
        let line = serde_json::to_string(&request)
            .map_err(|err| EngineFailure::ConnectionLost(format!("encoding request: {err}")))?;
        writeln!(self.stdin, "{line}")
            .and_then(|()| self.stdin.flush())
            .map_err(|err| EngineFailure::ConnectionLost(err.to_string()))?;

        let line = self.receive()?;
        let response: Response = serde_json::from_str(&line).map_err(|err| {
            EngineFailure::ConnectionLost(format!("malformed bridge response: {err}"))
        })?;
        match response.error {
            Some(err) => Err(EngineFailure::Statement(err)),
            None => Ok(EngineRows::new(response.columns, response.rows)),
        }
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns one bridge process per connection.
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ProcessFactory {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl EngineFactory for ProcessFactory {
    fn connect(&self) -> Result<Box<dyn SqlEngine>, EngineFailure> {
        Ok(Box::new(ProcessEngine::spawn(
            &self.program,
            &self.args,
            self.timeout,
        )?))
    }
}
