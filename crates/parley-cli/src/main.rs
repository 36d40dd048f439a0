mod config;
mod gateway;
mod render;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use coordination::debate::{
    DebateFormat, DebateMode, DebateRegistry, DebateSetup, DebateStatus, Decision,
    JsonFileStore, JudgeRef, ParticipantSpec,
};
use coordination::context::SummarizerModel;
use coordination::events::{DebateEvent, FilteredReceiver};
use coordination::recovery::DecisionOption;
use coordination::EngineConfig;

use config::{parse_backend_model, Endpoints};
use gateway::OpenAiCompatGateway;
use render::Renderer;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    FreeForm,
    StructuredRounds,
    RoundLimited,
    ConvergenceSeeking,
}

impl From<FormatArg> for DebateFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::FreeForm => DebateFormat::FreeForm,
            FormatArg::StructuredRounds => DebateFormat::StructuredRounds,
            FormatArg::RoundLimited => DebateFormat::RoundLimited,
            FormatArg::ConvergenceSeeking => DebateFormat::ConvergenceSeeking,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Simultaneous,
    Sequential,
}

impl From<ModeArg> for DebateMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Simultaneous => DebateMode::Simultaneous,
            ModeArg::Sequential => DebateMode::Sequential,
        }
    }
}

/// Run a structured debate between models on OpenAI-compatible endpoints.
///
/// Endpoints come from `PARLEY_BASE_URL` / `PARLEY_API_KEY`, or per backend
/// from `PARLEY_BACKEND_<NAME>_URL` / `PARLEY_BACKEND_<NAME>_API_KEY`.
#[derive(Debug, Parser)]
#[command(name = "parley", version)]
struct Cli {
    /// Debate topic.
    topic: String,

    /// Participant as `backend:model` (2 to 4, repeatable).
    #[arg(short, long = "participant", required = true, value_name = "BACKEND:MODEL")]
    participants: Vec<String>,

    /// Judge as `backend:model`; without one, rounds are scored heuristically.
    #[arg(short, long, value_name = "BACKEND:MODEL")]
    judge: Option<String>,

    #[arg(short, long, value_enum, default_value = "round-limited")]
    format: FormatArg,

    #[arg(short, long, value_enum, default_value = "simultaneous")]
    mode: ModeArg,

    /// Model that condenses older history as `backend:model`; turns
    /// summarization on.
    #[arg(short, long, value_name = "BACKEND:MODEL")]
    summarizer: Option<String>,

    /// Round limit for `round-limited`; round cap otherwise.
    #[arg(short, long)]
    rounds: Option<u32>,

    /// Engine configuration (TOML). `PARLEY_*` variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for debate snapshots.
    #[arg(short, long, default_value = "debates")]
    output: PathBuf,
}

impl Cli {
    fn setup(&self) -> Result<DebateSetup> {
        let participants = self
            .participants
            .iter()
            .map(|p| {
                let (backend, model) = parse_backend_model(p)?;
                Ok(ParticipantSpec::new(&backend, &model))
            })
            .collect::<Result<Vec<_>>>()?;
        let judge = match &self.judge {
            Some(j) => {
                let (backend, model) = parse_backend_model(j)?;
                Some(JudgeRef {
                    id: "judge".to_string(),
                    backend,
                    model,
                })
            }
            None => None,
        };
        let format = DebateFormat::from(self.format);
        let (round_limit, max_rounds) = match format {
            DebateFormat::RoundLimited => (Some(self.rounds.unwrap_or(3)), None),
            _ => (None, self.rounds),
        };
        Ok(DebateSetup {
            topic: self.topic.clone(),
            format,
            mode: self.mode.into(),
            round_limit,
            participants,
            judge,
            max_rounds,
        })
    }

    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => EngineConfig::default(),
        };
        config
            .apply_env()
            .context("invalid PARLEY_* override")?;
        if let Some(summarizer) = &self.summarizer {
            let (backend, model) = parse_backend_model(summarizer)?;
            config.context.summarizer = Some(SummarizerModel { backend, model });
            config.context.summarization_enabled = true;
        }
        Ok(config)
    }

    fn backends(&self) -> Vec<&str> {
        self.participants
            .iter()
            .chain(self.judge.iter())
            .chain(self.summarizer.iter())
            .filter_map(|p| p.split_once(':').map(|(backend, _)| backend))
            .collect()
    }
}

/// Resolve a pending decision without a human in the loop.
fn auto_decision(options: &[DecisionOption]) -> Option<Decision> {
    options.iter().find_map(|option| match option {
        DecisionOption::SummarizeAndContinue => Some(Decision::SummarizeAndContinue),
        DecisionOption::ContinueWithoutJudge => Some(Decision::ContinueWithoutJudge),
        _ => None,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let setup = cli.setup()?;
    let config = cli.engine_config()?;
    let endpoints = Endpoints::from_env(&cli.backends());

    let store = Arc::new(JsonFileStore::new(&cli.output));
    let registry = DebateRegistry::builder(Arc::new(OpenAiCompatGateway::new(endpoints)))
        .with_config(config)
        .with_store(store.clone())
        .build()
        .context("invalid engine configuration")?;

    let debate = registry
        .create(setup)
        .await
        .context("failed to create debate")?;
    info!(debate_id = %debate.id(), topic = %cli.topic, "debate created");

    let mut events = debate.subscribe();
    let mut status = debate.watch_status();
    debate.start().await.context("debate failed validation")?;

    let mut renderer = Renderer::new();
    let mut stopping = false;
    let final_status = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&mut renderer, &event)?;
                    if let DebateEvent::DecisionRequired { options, .. } = &event {
                        match auto_decision(options) {
                            Some(decision) => {
                                info!(option = %decision.option(), "resolving decision");
                                debate.decide(decision).await?;
                            }
                            None => {
                                warn!("no automatic resolution; stopping");
                                debate.stop().await?;
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "renderer lagged"),
                Err(RecvError::Closed) => break debate.status(),
            },
            changed = status.changed() => {
                let current = *status.borrow_and_update();
                if changed.is_err() || current.is_terminal() || matches!(current, DebateStatus::Error { .. }) {
                    break current;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                if stopping {
                    bail!("interrupted");
                }
                stopping = true;
                info!("stopping debate; press Ctrl-C again to abort");
                if let Err(e) = debate.stop().await {
                    warn!(error = %e, "stop rejected");
                }
            }
        }
    };

    drain(&mut renderer, &mut events).await?;

    match final_status {
        DebateStatus::Completed => {
            info!(path = %store.path_for(debate.id()).display(), "debate complete");
            Ok(())
        }
        other => bail!("debate ended in state {other}"),
    }
}

fn print_event(renderer: &mut Renderer, event: &DebateEvent) -> Result<()> {
    if let Some(text) = renderer.render(event) {
        let mut out = std::io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()?;
    }
    Ok(())
}

/// Print events published just before the final status change.
async fn drain(renderer: &mut Renderer, events: &mut FilteredReceiver) -> Result<()> {
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await
    {
        print_event(renderer, &event)?;
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_builds_round_limited_setup() {
        let cli = Cli::parse_from([
            "parley",
            "Is Rust worth it?",
            "-p",
            "local:qwen",
            "-p",
            "cloud:gpt-4o",
            "--judge",
            "cloud:gpt-4o-mini",
            "--rounds",
            "2",
        ]);
        let setup = cli.setup().unwrap();
        assert_eq!(setup.format, DebateFormat::RoundLimited);
        assert_eq!(setup.round_limit, Some(2));
        assert_eq!(setup.participants.len(), 2);
        assert_eq!(setup.participants[1].backend, "cloud");
        assert_eq!(setup.judge.unwrap().model, "gpt-4o-mini");
        assert_eq!(cli.backends(), vec!["local", "cloud", "cloud"]);
    }

    #[test]
    fn test_rounds_cap_other_formats() {
        let cli = Cli::parse_from([
            "parley", "t", "-p", "a:m", "-p", "b:m", "-f", "free-form", "-r", "6",
        ]);
        let setup = cli.setup().unwrap();
        assert_eq!(setup.round_limit, None);
        assert_eq!(setup.max_rounds, Some(6));
        assert!(setup.judge.is_none());
    }

    #[test]
    fn test_summarizer_flag_enables_summaries() {
        let cli = Cli::parse_from([
            "parley", "t", "-p", "a:m", "-p", "b:m", "-s", "local:qwen2.5:3b",
        ]);
        let config = cli.engine_config().unwrap();
        assert!(config.context.summarization_enabled);
        let summarizer = config.context.summarizer.unwrap();
        assert_eq!(summarizer.backend, "local");
        assert_eq!(summarizer.model, "qwen2.5:3b");
        assert_eq!(cli.backends(), vec!["a", "b", "local"]);
    }

    #[test]
    fn test_auto_decision() {
        assert!(matches!(
            auto_decision(&DecisionOption::context_overflow()),
            Some(Decision::SummarizeAndContinue)
        ));
        assert!(matches!(
            auto_decision(&[DecisionOption::SwapJudge, DecisionOption::ContinueWithoutJudge]),
            Some(Decision::ContinueWithoutJudge)
        ));
        assert!(auto_decision(&[DecisionOption::EndNow]).is_none());
    }
}
