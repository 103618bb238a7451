//! Prompt-answering execution of interactive commands.
//!
//! On Linux the child also gets a pseudo-terminal as its controlling
//! terminal. Prompts written to `/dev/tty` are matched like any other output
//! and answered on the terminal; terminal output is reported with stderr.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant as Deadline};
use tracing::{debug, warn};

use super::local::{kill_group, launch_failure, std_command_for, timeout_error};
use super::{CommandOutput, CommandSpec, PromptTable};
use crate::error::{RunnerError, RunnerResult};

#[cfg(target_os = "linux")]
use super::terminal::Terminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stream {
    Stdout,
    Stderr,
    Terminal,
}

/// Trailing bytes of a UTF-8 sequence split across reads.
#[derive(Debug, Default)]
struct Utf8Carry(Vec<u8>);

impl Utf8Carry {
    /// Decode `bytes`, holding back an incomplete trailing character.
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.0.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.0) {
            Ok(_) => self.0.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.0.len(),
        };
        let rest = self.0.split_off(complete);
        let text = String::from_utf8_lossy(&self.0).into_owned();
        self.0 = rest;
        text
    }
}

/// Output seen so far, plus how much of it has been answered.
#[derive(Debug, Default)]
struct Transcript {
    stdout: Vec<u8>,
    /// Stderr and terminal output.
    stderr: Vec<u8>,
    /// All streams in arrival order; prompts are matched here.
    combined: String,
    consumed: usize,
    carry: [Utf8Carry; 3],
}

impl Transcript {
    fn push(&mut self, stream: Stream, bytes: &[u8]) {
        let carry = match stream {
            Stream::Stdout => {
                self.stdout.extend_from_slice(bytes);
                &mut self.carry[0]
            }
            Stream::Stderr => {
                self.stderr.extend_from_slice(bytes);
                &mut self.carry[1]
            }
            Stream::Terminal => {
                self.stderr.extend_from_slice(bytes);
                &mut self.carry[2]
            }
        };
        let text = carry.decode(bytes);
        self.combined.push_str(&text);
    }

    fn pending(&self) -> &str {
        &self.combined[self.consumed..]
    }

    fn consume(&mut self, len: usize) {
        self.consumed += len;
    }

    /// Unterminated trailing line that looks like it wants input.
    fn dangling_prompt(&self) -> Option<&str> {
        let pending = self.pending();
        if pending.ends_with('\n') {
            return None;
        }
        let tail = pending.rsplit('\n').next()?.trim();
        (tail.ends_with(':') || tail.ends_with('?')).then_some(tail)
    }

    /// Captured stdout and stderr, decoded once.
    fn into_streams(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

/// Where answers are typed.
struct Input {
    stdin: Option<ChildStdin>,
    #[cfg(target_os = "linux")]
    terminal: Option<Terminal>,
}

impl Input {
    /// Send `response` to the channel the prompt arrived on.
    async fn answer(&mut self, spec: &CommandSpec, source: Stream, response: &str) -> RunnerResult<()> {
        let line = format!("{}\n", response);
        #[cfg(target_os = "linux")]
        if source == Stream::Terminal {
            if let Some(terminal) = &self.terminal {
                return terminal.write_all(line.as_bytes()).await.map_err(|e| {
                    RunnerError::Interaction {
                        command: spec.to_string(),
                        reason: e.to_string(),
                    }
                });
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = source;

        let Some(pipe) = self.stdin.as_mut() else {
            return Ok(());
        };
        let written = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        }
        .await;

        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                warn!(command = %spec, "Child closed stdin before the prompt was answered");
                self.stdin = None;
                Ok(())
            }
            Err(e) => Err(RunnerError::Interaction {
                command: spec.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Run `spec`, answering prompts from `prompts` until the child exits.
///
/// A dangling prompt no pattern answers fails the run once it has gone
/// `prompt_idle` without further output. Either failure kills the child's
/// process group.
pub(super) async fn drive(
    spec: &CommandSpec,
    prompts: &PromptTable,
    timeout: Duration,
    prompt_idle: Duration,
) -> RunnerResult<CommandOutput> {
    let start = Instant::now();
    let deadline = Deadline::now() + timeout;
    debug!(command = %spec, prompts = prompts.len(), "Running interactive command");

    let mut command = std_command_for(spec);
    #[cfg(target_os = "linux")]
    let terminal = match Terminal::open() {
        Ok(terminal) => {
            terminal.attach(&mut command);
            Some(terminal)
        }
        Err(err) => {
            warn!(command = %spec, error = %err, "No pseudo-terminal, prompts on /dev/tty will not be seen");
            None
        }
    };

    let mut child = tokio::process::Command::from(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| launch_failure(spec, e))?;
    let pid = child.id();

    let (tx, mut rx) = mpsc::channel(64);
    let mut open_pipes = 0;
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, Stream::Stdout, tx.clone()));
        open_pipes += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, Stream::Stderr, tx.clone()));
        open_pipes += 1;
    }
    #[cfg(target_os = "linux")]
    let forwarder = terminal.as_ref().map(|t| t.forward(tx.clone()));
    drop(tx);

    let mut input = Input {
        stdin: child.stdin.take(),
        #[cfg(target_os = "linux")]
        terminal,
    };
    let mut transcript = Transcript::default();
    let mut idle_deadline: Option<Deadline> = None;

    let outcome: RunnerResult<()> = loop {
        if open_pipes == 0 {
            break Ok(());
        }
        tokio::select! {
            _ = sleep_until(deadline) => {
                break Err(timeout_error(spec, timeout));
            }
            _ = sleep_until(idle_deadline.unwrap_or(deadline)), if idle_deadline.is_some() => {
                let prompt = transcript.dangling_prompt().unwrap_or_default().to_string();
                break Err(RunnerError::UnexpectedPrompt {
                    command: spec.to_string(),
                    prompt,
                });
            }
            chunk = rx.recv() => {
                let Some((stream, bytes)) = chunk else {
                    break Ok(());
                };
                // An empty chunk marks the end of a pipe.
                if bytes.is_empty() {
                    open_pipes -= 1;
                    continue;
                }
                transcript.push(stream, &bytes);
                if let Err(err) = answer_prompts(spec, prompts, &mut transcript, &mut input, stream).await {
                    break Err(err);
                }
                idle_deadline = transcript
                    .dangling_prompt()
                    .map(|_| Deadline::now() + prompt_idle);
            }
        }
    };

    #[cfg(target_os = "linux")]
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    if let Err(err) = outcome {
        kill_group(spec, pid);
        return Err(err);
    }
    drop(input);

    let status = match timeout_at(deadline, child.wait()).await {
        Ok(status) => status.map_err(|e| RunnerError::Interaction {
            command: spec.to_string(),
            reason: e.to_string(),
        })?,
        Err(_) => {
            kill_group(spec, pid);
            return Err(timeout_error(spec, timeout));
        }
    };

    let (stdout, stderr) = transcript.into_streams();
    let output = CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    debug!(
        command = %spec,
        exit_code = output.exit_code,
        duration_ms = output.duration_ms,
        "Interactive command finished"
    );
    Ok(output)
}

async fn answer_prompts(
    spec: &CommandSpec,
    prompts: &PromptTable,
    transcript: &mut Transcript,
    input: &mut Input,
    source: Stream,
) -> RunnerResult<()> {
    while let Some((end, response)) = prompts.find(transcript.pending()) {
        if end == 0 {
            break;
        }
        transcript.consume(end);
        // Responses are credentials; never log them.
        debug!(command = %spec, stream = ?source, "Answering prompt");
        input.answer(spec, source, response).await?;
    }
    Ok(())
}

/// Forward a pipe to `tx`, then send an empty chunk.
async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<(Stream, Vec<u8>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.send((stream, Vec::new())).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dangling_prompt_detection() {
        let mut transcript = Transcript::default();
        transcript.push(Stream::Stdout, b"Creating image...\n[sudo] password for user: ");
        assert_eq!(transcript.dangling_prompt(), Some("[sudo] password for user:"));
    }

    #[test]
    fn test_terminated_line_is_not_a_prompt() {
        let mut transcript = Transcript::default();
        transcript.push(Stream::Stdout, b"Querying database:\n");
        assert_eq!(transcript.dangling_prompt(), None);
    }

    #[test]
    fn test_progress_fragment_is_not_a_prompt() {
        let mut transcript = Transcript::default();
        transcript.push(Stream::Stderr, b"copying 45%");
        assert_eq!(transcript.dangling_prompt(), None);
        assert_eq!(transcript.into_streams(), (String::new(), "copying 45%".to_string()));
    }

    #[test]
    fn test_consumed_prompt_no_longer_dangles() {
        let mut transcript = Transcript::default();
        transcript.push(Stream::Stdout, b"Password for user firmadyne: ");
        let len = transcript.pending().len();
        transcript.consume(len);
        assert_eq!(transcript.pending(), "");
        assert_eq!(transcript.dangling_prompt(), None);
    }

    #[test]
    fn test_character_split_across_reads() {
        let mut transcript = Transcript::default();
        let text = "Mot de passe pour l'utilisateur «firmadyne» : ";
        let bytes = text.as_bytes();
        let split = text.find('«').unwrap() + 1;

        transcript.push(Stream::Stdout, &bytes[..split]);
        assert!(!transcript.pending().contains('\u{FFFD}'));
        transcript.push(Stream::Stdout, &bytes[split..]);

        assert_eq!(transcript.pending(), text);
        assert_eq!(transcript.dangling_prompt(), Some(text.trim()));
        let (stdout, stderr) = transcript.into_streams();
        assert_eq!(stdout, text);
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_streams_carry_split_characters_separately() {
        let mut transcript = Transcript::default();
        let e_acute = "é".as_bytes();

        transcript.push(Stream::Stdout, &e_acute[..1]);
        transcript.push(Stream::Stderr, b"warn\n");
        transcript.push(Stream::Stdout, &e_acute[1..]);

        assert_eq!(transcript.pending(), "warn\né");
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut transcript = Transcript::default();
        transcript.push(Stream::Terminal, b"ok \xff\n");
        assert_eq!(transcript.pending(), "ok \u{FFFD}\n");
        assert_eq!(transcript.into_streams().1, "ok \u{FFFD}\n");
    }
}
