use crate::{cli, config::Config};
use anyhow::Context;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wingman::provider::SamplingParams;
use wingman::{
    Adapter, Backend, Client, ClientSettings, ConversationTurn, Credential, ProviderSettings,
    ReqwestTransport, Session, TextDelta, DEFAULT_HISTORY_CEILING,
};

pub const DEFAULT_BACKEND: Backend = Backend::Ollama;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a concise, precise programming assistant.";

/// Non-blank process environment variable.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn key_var(backend: Backend) -> Option<&'static str> {
    match backend {
        Backend::Anthropic => Some("ANTHROPIC_API_KEY"),
        Backend::OpenAi => Some("OPENAI_API_KEY"),
        Backend::Google => Some("GEMINI_API_KEY"),
        Backend::Ollama => None,
    }
}

pub fn resolve_backend(args: &cli::Args, cfg: &Config) -> Backend {
    args.backend.or(cfg.backend).unwrap_or(DEFAULT_BACKEND)
}

/// Environment beats the config file; defaults fill the rest.
pub fn provider_settings(
    backend: Backend,
    cfg: &Config,
    env: &dyn Fn(&str) -> Option<String>,
) -> anyhow::Result<ProviderSettings> {
    let section = cfg.section(backend);
    let mut settings = ProviderSettings::for_backend(backend)?;

    let base_url = match backend {
        Backend::Ollama => env("OLLAMA_HOST").map(|h| with_scheme(&h)).or_else(|| section.base_url.clone()),
        _ => section.base_url.clone(),
    };
    if let Some(base) = base_url {
        settings = settings
            .with_base_url(&base)
            .with_context(|| format!("bad base_url for the {backend} backend"))?;
    }

    let api_key = key_var(backend)
        .and_then(|var| env(var))
        .or_else(|| section.api_key.clone());
    if let Some(key) = api_key {
        let credential = match backend {
            Backend::OpenAi => Credential::BearerToken(key),
            _ => Credential::ApiKey(key),
        };
        settings = settings.with_credential(credential);
    }

    if let Some(secs) = section.timeout_secs {
        settings = settings.with_timeout(Duration::from_secs(secs));
    }
    if let Some(fim) = section.fim {
        settings.fim = fim;
    }
    if let Some(split) = section.object_split {
        settings.object_split = split;
    }
    Ok(settings)
}

// OLLAMA_HOST is often just `host:port`.
fn with_scheme(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// `--model` beats the backend's table, which beats the top-level keys.
pub fn client_settings(backend: Backend, cfg: &Config, model_override: Option<&str>) -> ClientSettings {
    let section = cfg.section(backend);
    let mut settings = ClientSettings::for_backend(backend);

    if let Some(model) = model_override
        .map(str::to_string)
        .or_else(|| section.model.clone())
        .or_else(|| cfg.model.clone())
    {
        settings.model = model;
    }
    if let Some(model) = model_override
        .map(str::to_string)
        .or_else(|| section.code_model.clone())
        .or_else(|| cfg.code_model.clone())
    {
        settings.code_model = model;
    }

    let sampling = SamplingParams {
        temperature: section.temperature,
        top_p: section.top_p,
        top_k: section.top_k,
        max_tokens: section.max_tokens,
    };
    settings.sampling = sampling;
    settings.code_sampling = sampling;
    settings.hedge = cfg.hedge.apply(settings.hedge);
    settings
}

pub fn build_client(args: &cli::Args, cfg: &Config) -> anyhow::Result<Client> {
    let backend = resolve_backend(args, cfg);
    let settings = provider_settings(backend, cfg, &process_env)?;
    let adapter = Adapter::new(backend, settings)?;
    let transport = ReqwestTransport::with_default_client()?;
    let client_settings = client_settings(backend, cfg, args.model.as_deref());
    tracing::debug!(%backend, model = %client_settings.model, "client ready");
    Ok(Client::new(adapter, Arc::new(transport), client_settings))
}

pub fn new_session(cfg: &Config) -> Session {
    let prompt = cfg.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
    Session::new(prompt).with_ceiling(cfg.history_ceiling.unwrap_or(DEFAULT_HISTORY_CEILING))
}

/// Ctrl-C cancels the call in flight; with nothing in flight it exits.
#[derive(Debug, Clone)]
pub struct Interrupts {
    current: Arc<watch::Sender<CancellationToken>>,
}

impl Interrupts {
    pub fn install() -> Self {
        let idle = CancellationToken::new();
        idle.cancel();
        let (tx, _rx) = watch::channel(idle);
        let current = Arc::new(tx);

        let watcher = Arc::clone(&current);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let token = watcher.borrow().clone();
                if token.is_cancelled() {
                    std::process::exit(130);
                }
                tracing::info!("interrupted; cancelling request");
                token.cancel();
            }
        });

        Self { current }
    }

    /// Fresh token for the next call.
    pub fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.current.send_replace(token.clone());
        token
    }

    pub fn disarm(&self) {
        let idle = CancellationToken::new();
        idle.cancel();
        self.current.send_replace(idle);
    }
}

fn print_delta(delta: &TextDelta) {
    if let Some(text) = delta.text() {
        let mut out = std::io::stdout().lock();
        write!(out, "{text}").ok();
        out.flush().ok();
    }
}

async fn chat_round(client: &Client, session: &mut Session, prompt: &str, interrupts: &Interrupts) {
    let cancel = interrupts.arm();
    let reply = client
        .chat(session, ConversationTurn::user(prompt), &cancel, print_delta)
        .await;
    interrupts.disarm();
    println!();

    if let Some(err) = reply.error {
        eprintln!("error: {err}");
    } else if reply.aborted {
        eprintln!("[cancelled]");
    }
}

pub async fn cmd_prompt(client: &Client, cfg: &Config, prompt: &str, interrupts: &Interrupts) -> anyhow::Result<()> {
    let mut session = new_session(cfg);
    chat_round(client, &mut session, prompt, interrupts).await;
    Ok(())
}

pub async fn cmd_repl(client: &Client, cfg: &Config, interrupts: &Interrupts) -> anyhow::Result<()> {
    let mut session = new_session(cfg);
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    eprintln!("wingman {} ({}). /clear resets history, /quit exits.", client.backend(), client.settings().model);
    loop {
        eprint!("> ");
        std::io::stderr().flush().ok();
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                session.clear();
                eprintln!("history cleared");
            }
            prompt => chat_round(client, &mut session, prompt, interrupts).await,
        }
    }
    Ok(())
}

pub async fn cmd_complete(
    client: &Client,
    file: &Path,
    line: usize,
    column: usize,
    interrupts: &Interrupts,
) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    let (prefix, suffix) = split_at_cursor(&source, line, column)?;

    let cancel = interrupts.arm();
    let outcome = client.complete_code(prefix, suffix, &cancel).await;
    interrupts.disarm();

    tracing::debug!(exit = ?outcome.exit, elapsed_ms = outcome.elapsed.as_millis() as u64, "completion finished");
    println!("{}", outcome.text);
    Ok(())
}

/// Split `source` at a 1-based line and character column. A column past the
/// end of the line lands at the line end.
pub fn split_at_cursor(source: &str, line: usize, column: usize) -> anyhow::Result<(&str, &str)> {
    if line == 0 || column == 0 {
        anyhow::bail!("line and column are 1-based");
    }

    let mut start = 0;
    for _ in 1..line {
        match source[start..].find('\n') {
            Some(i) => start += i + 1,
            None => anyhow::bail!("line {line} is past the end of the file"),
        }
    }

    let line_text = source[start..].split('\n').next().unwrap_or_default();
    let offset = line_text
        .char_indices()
        .nth(column - 1)
        .map(|(i, _)| i)
        .unwrap_or(line_text.len());
    Ok(source.split_at(start + offset))
}
