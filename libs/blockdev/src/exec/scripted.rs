//! Scripted [`CommandRunner`] for tests and dry runs.
//!
//! Replies are keyed by program name plus leading arguments; the longest
//! matching prefix wins. Registering the same key twice queues a second
//! reply: queued replies are consumed in order and the last one sticks.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::{render, CommandError, CommandRunner};

/// Exit status reported for calls nothing was scripted for.
const UNSCRIPTED_STATUS: i32 = 127;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// The invocation as a single command line.
    pub fn line(&self) -> String {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        render(&self.program, &args)
    }

    fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Stdout(String),
    Failure { status: i32, stderr: String },
}

#[derive(Debug)]
struct Rule {
    program: String,
    prefix: Vec<String>,
    replies: VecDeque<Reply>,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        invocation.program_name() == self.program && invocation.args.starts_with(&self.prefix)
    }

    fn next_reply(&mut self) -> Reply {
        if self.replies.len() > 1 {
            if let Some(reply) = self.replies.pop_front() {
                return reply;
            }
        }
        self.replies
            .front()
            .cloned()
            .unwrap_or_else(|| Reply::Stdout(String::new()))
    }
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    installed: HashSet<String>,
    calls: Vec<Invocation>,
}

/// In-memory runner that replays scripted replies and records every call.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<Script>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `stdout` to `program` invoked with args starting with `prefix`.
    pub fn respond(&self, program: &str, prefix: &[&str], stdout: &str) -> &Self {
        self.push(program, prefix, Reply::Stdout(stdout.to_string()))
    }

    /// Fail `program` invoked with args starting with `prefix`.
    pub fn fail(&self, program: &str, prefix: &[&str], status: i32, stderr: &str) -> &Self {
        self.push(
            program,
            prefix,
            Reply::Failure {
                status,
                stderr: stderr.to_string(),
            },
        )
    }

    /// Make `program` resolvable through [`CommandRunner::locate`].
    pub fn install(&self, program: &str) -> &Self {
        self.lock().installed.insert(program.to_string());
        self
    }

    /// All invocations so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.lock().calls.clone()
    }

    /// All invocations so far rendered as command lines.
    pub fn lines(&self) -> Vec<String> {
        self.lock().calls.iter().map(Invocation::line).collect()
    }

    /// Number of invocations of `program` whose args start with `prefix`.
    pub fn count(&self, program: &str, prefix: &[&str]) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.program_name() == program && starts_with(&c.args, prefix))
            .count()
    }

    fn push(&self, program: &str, prefix: &[&str], reply: Reply) -> &Self {
        let mut script = self.lock();
        let prefix: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        match script
            .rules
            .iter_mut()
            .find(|r| r.program == program && r.prefix == prefix)
        {
            Some(rule) => rule.replies.push_back(reply),
            None => script.rules.push(Rule {
                program: program.to_string(),
                prefix,
                replies: VecDeque::from([reply]),
            }),
        }
        drop(script);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn starts_with(args: &[String], prefix: &[&str]) -> bool {
    args.len() >= prefix.len() && args.iter().zip(prefix).all(|(a, p)| a == p)
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        };

        let mut script = self.lock();
        script.calls.push(invocation.clone());

        let reply = script
            .rules
            .iter_mut()
            .filter(|r| r.matches(&invocation))
            .max_by_key(|r| r.prefix.len())
            .map(Rule::next_reply);

        match reply {
            Some(Reply::Stdout(stdout)) => Ok(stdout.trim().to_string()),
            Some(Reply::Failure { status, stderr }) => Err(CommandError::Failed {
                command: invocation.line(),
                status: Some(status),
                stderr,
            }),
            None => Err(CommandError::Failed {
                command: invocation.line(),
                status: Some(UNSCRIPTED_STATUS),
                stderr: format!("{}: command not scripted", program),
            }),
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.lock()
            .installed
            .contains(program)
            .then(|| PathBuf::from("/usr/sbin").join(program))
    }
}
