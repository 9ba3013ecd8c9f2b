//! Shell-integration stream processor.
//!
//! Sits between the PTY engine and the terminal emulator. Parses a private
//! OSC side channel (`ESC ] 7770 ; … BEL`) out of the raw byte stream to
//! derive per-session run state, strips those sequences from the
//! emulator-bound bytes, and — when the stream looks like an unhooked
//! sub-shell (`ssh` to a host without our hooks) — re-injects the hook
//! script into the PTY.
//!
//! The processor must survive TCP-grade chunking: a sequence may be split at
//! any byte boundary, so an unterminated trailing prefix is carried over to
//! the next chunk.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use vte::{Parser, Perform};

use crate::workspace::SessionStatus;

/// Six-byte OSC introducer for the private protocol.
const OSC_PREFIX: &[u8] = b"\x1b]7770;";
const BEL: u8 = 0x07;

/// A sub-shell is suspected only after a command has been "running" this long
/// without a matching `precmd`.
const UNHOOKED_THRESHOLD: Duration = Duration::from_secs(2);
/// Debounce for the quiet-output detector.
const QUIET_DEBOUNCE: Duration = Duration::from_millis(1500);
/// How long to wait for an OSC after the user presses Enter.
const ENTER_WAIT: Duration = Duration::from_millis(500);
/// After a re-injection attempt, how long to wait for proof it worked.
const VERIFY_WAIT: Duration = Duration::from_secs(3);
/// Re-injection attempts allowed per active command.
const MAX_REINJECTION_ATTEMPTS: u8 = 3;

/// Hook installer one-liner, written to the PTY verbatim. The single leading
/// space keeps it out of shell history (`HISTCONTROL=ignorespace`); the shell
/// is detected inline via `$ZSH_VERSION` / `$BASH_VERSION`.
pub const HOOK_SCRIPT: &str = concat!(
    " if [ -n \"$ZSH_VERSION\" ]; then ",
    "__dp_precmd() { printf '\\033]7770;precmd;%d\\007' $?; }; ",
    "__dp_preexec() { printf '\\033]7770;preexec\\007'; }; ",
    "typeset -ga precmd_functions preexec_functions; ",
    "precmd_functions+=(__dp_precmd); preexec_functions+=(__dp_preexec); ",
    "elif [ -n \"$BASH_VERSION\" ]; then ",
    "__dp_precmd() { local __dp_ec=$?; __dp_prompt_shown=1; printf '\\033]7770;precmd;%d\\007' \"$__dp_ec\"; }; ",
    "__dp_preexec() { if [ -n \"$__dp_prompt_shown\" ]; then __dp_prompt_shown=; printf '\\033]7770;preexec\\007'; fi; }; ",
    "PROMPT_COMMAND=\"__dp_precmd${PROMPT_COMMAND:+;$PROMPT_COMMAND}\"; ",
    "trap '__dp_preexec' DEBUG; ",
    "fi\n",
);

/// Notice typed into the PTY ahead of a re-injected hook script.
const REINJECT_NOTICE: &str = " printf '[dispatcher] installing shell hooks\\n'\n";

/// Services the processor needs from its embedding: a way to type into the
/// PTY and a status side channel. Implemented by the `Dispatcher` facade;
/// tests substitute a recorder.
pub trait IntegrationHost: Send + Sync + 'static {
    /// Write bytes into the PTY (hook injection).
    fn write_to_pty(&self, terminal_id: &str, bytes: &[u8]);
    /// Report a run-state transition derived from the OSC stream.
    fn set_status(&self, terminal_id: &str, status: SessionStatus, exit_code: Option<i32>);
}

/// Parsed payload of one complete OSC 7770 sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OscPayload {
    Preexec,
    Precmd(i32),
    Unknown,
}

struct DetectorState {
    /// Unterminated trailing OSC prefix carried to the next chunk.
    partial: Vec<u8>,
    /// True between a `preexec` and the matching `precmd`.
    running: bool,
    last_preexec: Option<Instant>,
    /// Re-injection attempts for the current command.
    attempts: u8,
    /// An attempt is pending its verification window.
    attempted: bool,
    /// Timer generations; bumping one cancels the armed timer of that kind.
    quiet_gen: u64,
    enter_gen: u64,
    verify_gen: u64,
}

/// Per-terminal OSC 7770 processor. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ShellIntegration {
    terminal_id: String,
    host: Arc<dyn IntegrationHost>,
    state: Arc<Mutex<DetectorState>>,
}

impl ShellIntegration {
    pub fn new(terminal_id: impl Into<String>, host: Arc<dyn IntegrationHost>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            host,
            state: Arc::new(Mutex::new(DetectorState {
                partial: Vec::new(),
                running: false,
                last_preexec: None,
                attempts: 0,
                attempted: false,
                quiet_gen: 0,
                enter_gen: 0,
                verify_gen: 0,
            })),
        }
    }

    /// Performs the initial hook injection into a freshly spawned shell:
    /// echo off, a beat for the shell to come up, the script, echo on, clear.
    pub async fn inject_initial(&self) {
        let id = &self.terminal_id;
        self.host.write_to_pty(id, b" stty -echo\n");
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.host.write_to_pty(id, HOOK_SCRIPT.as_bytes());
        self.host.write_to_pty(id, b" stty echo\n");
        self.host.write_to_pty(id, b" clear\n");
        log::debug!("Injected shell hooks into terminal {id}");
    }

    /// Filters one PTY output chunk.
    ///
    /// Returns the emulator-bound bytes with every complete OSC 7770 sequence
    /// removed. Status transitions for the sequences found are reported to the
    /// host *before* this returns, so status is always visible by the time the
    /// cleaned bytes hit the emulator.
    pub fn process_chunk(&self, chunk: &[u8]) -> Vec<u8> {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let mut data = std::mem::take(&mut st.partial);
        data.extend_from_slice(chunk);

        // An OSC prefix with no terminator yet is carried to the next chunk.
        if let Some(idx) = find_last(&data, OSC_PREFIX) {
            if !data[idx..].contains(&BEL) {
                st.partial = data.split_off(idx);
            }
        }

        let (cleaned, payloads) = strip_osc(&data);

        if payloads.is_empty() {
            self.maybe_arm_quiet_timer(&mut st, &cleaned);
            return cleaned;
        }

        // Any OSC proves the hooks are alive: cancel all pending detection
        // timers and reset the re-injection guard.
        st.quiet_gen += 1;
        st.enter_gen += 1;
        st.verify_gen += 1;
        st.attempts = 0;
        st.attempted = false;

        for payload in &payloads {
            match payload {
                OscPayload::Preexec => {
                    st.running = true;
                    st.last_preexec = Some(Instant::now());
                    self.host
                        .set_status(&self.terminal_id, SessionStatus::Running, None);
                }
                OscPayload::Precmd(code) => {
                    st.running = false;
                    let status = if *code == 0 {
                        SessionStatus::Done
                    } else {
                        SessionStatus::Error
                    };
                    self.host.set_status(&self.terminal_id, status, Some(*code));
                }
                OscPayload::Unknown => {}
            }
        }

        cleaned
    }

    /// Called when the user presses Enter. If a command has been running
    /// without OSC traffic past the threshold, waits briefly for one and
    /// re-injects hooks if none arrives — the keypress was probably handled
    /// by an unhooked remote shell.
    pub fn notify_enter_pressed(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.unhooked_suspected(&st) {
            return;
        }
        st.enter_gen += 1;
        let gen = st.enter_gen;
        drop(st);

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ENTER_WAIT).await;
            this.on_detection_timer(TimerKind::Enter, gen);
        });
    }

    /// Discards all pending bytes and timers. Call on terminal teardown.
    pub fn dispose(&self) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.partial.clear();
        st.quiet_gen += 1;
        st.enter_gen += 1;
        st.verify_gen += 1;
    }

    /// True while a command is "running" but stopped producing OSCs long
    /// enough ago that the shell handling input is probably not hooked.
    fn unhooked_suspected(&self, st: &DetectorState) -> bool {
        st.running
            && st
                .last_preexec
                .map(|t| t.elapsed() >= UNHOOKED_THRESHOLD)
                .unwrap_or(false)
    }

    /// Quiet-output detector: an OSC-free chunk whose final non-empty
    /// de-ANSI'd line looks like a shell prompt (re)starts the quiet timer.
    /// `:` and `?` are deliberately not treated as prompts — password and
    /// 2FA prompts end with those.
    fn maybe_arm_quiet_timer(&self, st: &mut DetectorState, cleaned: &[u8]) {
        if !self.unhooked_suspected(st) || !ends_with_prompt(cleaned) {
            return;
        }
        st.quiet_gen += 1;
        let gen = st.quiet_gen;

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(QUIET_DEBOUNCE).await;
            this.on_detection_timer(TimerKind::Quiet, gen);
        });
    }

    fn on_detection_timer(&self, kind: TimerKind, gen: u64) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let live = match kind {
            TimerKind::Quiet => st.quiet_gen == gen,
            TimerKind::Enter => st.enter_gen == gen,
            TimerKind::Verify => st.verify_gen == gen,
        };
        if !live {
            return;
        }

        if let TimerKind::Verify = kind {
            // No OSC arrived to confirm the attempt; allow another one.
            st.attempted = false;
            return;
        }

        if !st.running || st.attempted || st.attempts >= MAX_REINJECTION_ATTEMPTS {
            return;
        }
        st.attempted = true;
        st.attempts += 1;
        st.verify_gen += 1;
        let verify_gen = st.verify_gen;
        let attempt = st.attempts;
        drop(st);

        log::info!(
            "Terminal {}: unhooked sub-shell suspected, re-injecting hooks (attempt {attempt})",
            self.terminal_id
        );
        self.host
            .write_to_pty(&self.terminal_id, REINJECT_NOTICE.as_bytes());
        self.host
            .write_to_pty(&self.terminal_id, HOOK_SCRIPT.as_bytes());

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(VERIFY_WAIT).await;
            this.on_detection_timer(TimerKind::Verify, verify_gen);
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Quiet,
    Enter,
    Verify,
}

/// Finds the byte offset of the last occurrence of `needle` in `haystack`.
fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Removes every complete `ESC ] 7770 ; <payload> BEL` sequence from `data`,
/// returning the cleaned bytes and the parsed payloads in stream order.
/// An unterminated sequence (possible only mid-stream with a malformed
/// producer) is passed through untouched.
fn strip_osc(data: &[u8]) -> (Vec<u8>, Vec<OscPayload>) {
    let mut cleaned = Vec::with_capacity(data.len());
    let mut payloads = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        match find_first(&data[pos..], OSC_PREFIX) {
            Some(rel) => {
                let start = pos + rel;
                cleaned.extend_from_slice(&data[pos..start]);
                let body_start = start + OSC_PREFIX.len();
                match data[body_start..].iter().position(|&b| b == BEL) {
                    Some(bel_rel) => {
                        payloads.push(parse_payload(&data[body_start..body_start + bel_rel]));
                        pos = body_start + bel_rel + 1;
                    }
                    None => {
                        // Unterminated; emit as-is.
                        cleaned.extend_from_slice(&data[start..]);
                        pos = data.len();
                    }
                }
            }
            None => {
                cleaned.extend_from_slice(&data[pos..]);
                break;
            }
        }
    }

    (cleaned, payloads)
}

fn find_first(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn parse_payload(body: &[u8]) -> OscPayload {
    if body == b"preexec" {
        return OscPayload::Preexec;
    }
    if let Some(code) = body.strip_prefix(b"precmd;") {
        if let Ok(text) = std::str::from_utf8(code) {
            if let Ok(n) = text.trim().parse::<i32>() {
                return OscPayload::Precmd(n);
            }
        }
    }
    OscPayload::Unknown
}

/// Collects printable characters (and line breaks) out of a VT byte stream,
/// discarding CSI/OSC/DCS control sequences.
struct TextCollector {
    out: String,
}

impl Perform for TextCollector {
    fn print(&mut self, c: char) {
        self.out.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' => self.out.push('\n'),
            b'\t' => self.out.push(' '),
            _ => {}
        }
    }

    fn hook(&mut self, _: &vte::Params, _: &[u8], _: bool, _: char) {}
    fn put(&mut self, _: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _: &[&[u8]], _: bool) {}
    fn csi_dispatch(&mut self, _: &vte::Params, _: &[u8], _: bool, _: char) {}
    fn esc_dispatch(&mut self, _: &[u8], _: bool, _: u8) {}
}

fn strip_ansi(bytes: &[u8]) -> String {
    let mut parser = Parser::new();
    let mut collector = TextCollector { out: String::new() };
    parser.advance(&mut collector, bytes);
    collector.out
}

/// Shell-prompt heuristic: the final non-empty de-ANSI'd line ends in one of
/// `# $ % >` (plus optional trailing whitespace).
fn ends_with_prompt(bytes: &[u8]) -> bool {
    let text = strip_ansi(bytes);
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.trim_end().chars().last())
        .map(|c| matches!(c, '#' | '$' | '%' | '>'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHost {
        writes: StdMutex<Vec<Vec<u8>>>,
        statuses: StdMutex<Vec<(SessionStatus, Option<i32>)>>,
    }

    impl RecordingHost {
        fn written(&self) -> String {
            let writes = self.writes.lock().unwrap();
            String::from_utf8_lossy(&writes.concat()).into_owned()
        }

        fn last_status(&self) -> Option<(SessionStatus, Option<i32>)> {
            self.statuses.lock().unwrap().last().copied()
        }
    }

    impl IntegrationHost for RecordingHost {
        fn write_to_pty(&self, _terminal_id: &str, bytes: &[u8]) {
            self.writes.lock().unwrap().push(bytes.to_vec());
        }

        fn set_status(&self, _terminal_id: &str, status: SessionStatus, exit_code: Option<i32>) {
            self.statuses.lock().unwrap().push((status, exit_code));
        }
    }

    fn processor() -> (ShellIntegration, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        let proc = ShellIntegration::new("t1", host.clone() as Arc<dyn IntegrationHost>);
        (proc, host)
    }

    #[tokio::test]
    async fn test_preexec_sets_running_and_strips() {
        let (proc, host) = processor();
        let out = proc.process_chunk(b"before\x1b]7770;preexec\x07after");
        assert_eq!(out, b"beforeafter");
        assert_eq!(host.last_status(), Some((SessionStatus::Running, None)));
    }

    #[tokio::test]
    async fn test_precmd_zero_is_done_nonzero_is_error() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;precmd;0\x07");
        assert_eq!(host.last_status(), Some((SessionStatus::Done, Some(0))));
        proc.process_chunk(b"\x1b]7770;precmd;127\x07");
        assert_eq!(host.last_status(), Some((SessionStatus::Error, Some(127))));
    }

    #[tokio::test]
    async fn test_sequence_split_across_chunks() {
        // "output<prefix>pre" then "exec<BEL>more".
        let (proc, host) = processor();
        let first = proc.process_chunk(b"output\x1b]7770;pre");
        assert_eq!(first, b"output");
        let second = proc.process_chunk(b"exec\x07more");
        assert_eq!(second, b"more");
        assert_eq!(host.last_status(), Some((SessionStatus::Running, None)));
    }

    #[tokio::test]
    async fn test_prefix_split_mid_introducer_is_not_stashed() {
        // A split inside the 6-byte introducer itself cannot be recognized;
        // the bytes pass through, which matches emitting `d` when the full
        // prefix is absent.
        let (proc, _host) = processor();
        let first = proc.process_chunk(b"x\x1b]77");
        let second = proc.process_chunk(b"70;preexec\x07y");
        let mut combined = first;
        combined.extend_from_slice(&second);
        assert_eq!(combined, b"x\x1b]7770;preexec\x07y");
    }

    #[tokio::test]
    async fn test_last_osc_wins_within_chunk() {
        let (proc, host) = processor();
        let out =
            proc.process_chunk(b"\x1b]7770;preexec\x07mid\x1b]7770;precmd;2\x07tail");
        assert_eq!(out, b"midtail");
        assert_eq!(host.last_status(), Some((SessionStatus::Error, Some(2))));
        assert_eq!(host.statuses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_chunk_partition_invariance() {
        // Any partition of the stream yields the same concatenated output.
        let stream: &[u8] = b"a\x1b]7770;preexec\x07b\x1b]7770;precmd;0\x07c";
        let expected = b"abc".to_vec();
        for split in 1..stream.len() {
            let (proc, _host) = processor();
            let mut out = proc.process_chunk(&stream[..split]);
            out.extend(proc.process_chunk(&stream[split..]));
            assert_eq!(out, expected, "split at {split}");
        }
    }

    #[tokio::test]
    async fn test_initial_injection_order() {
        let (proc, host) = processor();
        proc.inject_initial().await;
        let text = host.written();
        let stty_off = text.find(" stty -echo").unwrap();
        let script = text.find(" if [ -n \"$ZSH_VERSION\" ]").unwrap();
        let stty_on = text.find(" stty echo").unwrap();
        let clear = text.find(" clear").unwrap();
        assert!(stty_off < script && script < stty_on && stty_on < clear);
        assert!(text.contains("precmd_functions+=(__dp_precmd)"));
        assert!(text.contains("trap '__dp_preexec' DEBUG"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_output_detector_reinjects() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07ssh remote\r\n");
        tokio::time::sleep(Duration::from_millis(2100)).await;

        // Prompt-looking chunk with no OSC: arms the 1.5 s quiet timer.
        proc.process_chunk(b"user@host:~$ ");
        tokio::time::sleep(Duration::from_millis(1600)).await;

        let text = host.written();
        assert!(text.contains("installing shell hooks"), "notice expected");
        assert!(text.contains("$ZSH_VERSION"), "script expected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_detector_ignores_password_prompts() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07ssh remote\r\n");
        tokio::time::sleep(Duration::from_millis(2100)).await;

        proc.process_chunk(b"user@host's password: ");
        proc.process_chunk(b"Passcode or option (1-3)? ");
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(host.written().is_empty(), "no injection for :/? prompts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_detector_requires_running_threshold() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07");
        // Only 1 s in: too early to suspect an unhooked shell.
        tokio::time::sleep(Duration::from_secs(1)).await;
        proc.process_chunk(b"host$ ");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(host.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_detector_reinjects_when_no_osc_follows() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07");
        tokio::time::sleep(Duration::from_millis(2100)).await;

        proc.notify_enter_pressed();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(host.written().contains("$ZSH_VERSION"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_detector_cancelled_by_osc() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07");
        tokio::time::sleep(Duration::from_millis(2100)).await;

        proc.notify_enter_pressed();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The hooked shell answers after all.
        proc.process_chunk(b"\x1b]7770;precmd;0\x07");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(host.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinjection_capped_at_three_attempts() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07");
        tokio::time::sleep(Duration::from_millis(2100)).await;

        for _ in 0..5 {
            proc.notify_enter_pressed();
            tokio::time::sleep(Duration::from_millis(600)).await;
            // Let the verification window lapse so the guard re-arms.
            tokio::time::sleep(VERIFY_WAIT + Duration::from_millis(100)).await;
        }

        let script_count = host.written().matches("$ZSH_VERSION").count();
        assert_eq!(script_count, MAX_REINJECTION_ATTEMPTS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn test_osc_resets_attempt_counter() {
        let (proc, host) = processor();
        proc.process_chunk(b"\x1b]7770;preexec\x07");
        tokio::time::sleep(Duration::from_millis(2100)).await;

        for _ in 0..3 {
            proc.notify_enter_pressed();
            tokio::time::sleep(Duration::from_millis(600)).await;
            tokio::time::sleep(VERIFY_WAIT + Duration::from_millis(100)).await;
        }
        assert_eq!(host.written().matches("$ZSH_VERSION").count(), 3);

        // Hooks respond: counter resets, a new command can try again.
        proc.process_chunk(b"\x1b]7770;preexec\x07");
        tokio::time::sleep(Duration::from_millis(2100)).await;
        proc.notify_enter_pressed();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(host.written().matches("$ZSH_VERSION").count(), 4);
    }

    #[test]
    fn test_strip_ansi_drops_color_codes() {
        let colored = b"\x1b[32muser@host\x1b[0m:~$ ";
        assert_eq!(strip_ansi(colored), "user@host:~$ ");
    }

    #[test]
    fn test_ends_with_prompt_heuristic() {
        assert!(ends_with_prompt(b"user@host:~$ "));
        assert!(ends_with_prompt(b"some output\r\nroot@box:/etc# "));
        assert!(ends_with_prompt(b"%\n"));
        assert!(ends_with_prompt(b"C:\\> "));
        assert!(!ends_with_prompt(b"password: "));
        assert!(!ends_with_prompt(b"continue? "));
        assert!(!ends_with_prompt(b"plain text"));
        assert!(!ends_with_prompt(b"   \n  "));
    }
}
