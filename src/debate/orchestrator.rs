// =============================================================================
// Debate Orchestrator — parallel role fan-out, referee consolidation
// =============================================================================
//
// One operation: `run_debate(symbol, trigger) -> Signal`.
//
//   1. Admission: signal cooldown (manual triggers bypass), quota tier.
//   2. Snapshot: single-flight per symbol via the provider.
//   3. Role fan-out: all N roles start together, each under its own hard
//      timeout. A failed role becomes a synthetic HOLD opinion; the debate
//      aborts only when every role failed.
//   4. Referee: one stronger-model call over the full panel output, parsed
//      through the schema gate. Referee failure activates the majority
//      fallback.
//   5. Assemble + persist the Signal, then publish: broadcast callback
//      first, executor callback only for actionable kinds. HOLD is
//      persisted but never executed.
//   6. Arm the per-direction signal cooldown.
//
// The orchestrator knows nothing about the executor; both meet at the bus.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bus::CallbackBus;
use crate::exec::cooldown::{CooldownKind, CooldownMap};
use crate::llm::quota::{QuotaAccountant, QuotaTier};
use crate::llm::{ChatMessage, LlmProvider};
use crate::market::SnapshotProvider;
use crate::runtime_config::RuntimeConfig;
use crate::schema::{parse_signal_text, GateStats};
use crate::signal::{RoleOpinion, Signal, StageTimestamps};
use crate::store::Store;
use crate::types::{DebateTrigger, RiskLevel, SignalKind, Symbol};

use super::roles::{referee_messages, role_messages, RoleSpec};

/// Typed debate failure.
#[derive(Debug, thiserror::Error)]
pub enum DebateError {
    #[error("cooldown active for {symbol} ({remaining_secs}s remaining)")]
    CooldownActive { symbol: Symbol, remaining_secs: i64 },
    #[error("llm quota {tier}: {detail}")]
    QuotaExhausted { tier: QuotaTier, detail: String },
    #[error("market snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("all {0} roles failed")]
    AllRolesFailed(usize),
    #[error("signal persistence failed: {0}")]
    Storage(String),
}

pub struct DebateOrchestrator {
    provider: Arc<dyn LlmProvider>,
    snapshots: Arc<SnapshotProvider>,
    quota: Arc<QuotaAccountant>,
    cooldowns: Arc<CooldownMap>,
    store: Arc<Store>,
    bus: Arc<CallbackBus>,
    config: Arc<RwLock<RuntimeConfig>>,
    gate_stats: Arc<GateStats>,
    panel: Vec<RoleSpec>,
}

impl DebateOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        snapshots: Arc<SnapshotProvider>,
        quota: Arc<QuotaAccountant>,
        cooldowns: Arc<CooldownMap>,
        store: Arc<Store>,
        bus: Arc<CallbackBus>,
        config: Arc<RwLock<RuntimeConfig>>,
        gate_stats: Arc<GateStats>,
        panel: Vec<RoleSpec>,
    ) -> Self {
        Self {
            provider,
            snapshots,
            quota,
            cooldowns,
            store,
            bus,
            config,
            gate_stats,
            panel,
        }
    }

    /// Run one debate end to end.
    pub async fn run_debate(
        &self,
        symbol: &Symbol,
        trigger: DebateTrigger,
    ) -> Result<Arc<Signal>, DebateError> {
        let debate_started = Instant::now();
        let config = self.config.read().clone();

        // ── 1. Admission ────────────────────────────────────────────────
        if trigger != DebateTrigger::Manual && self.cooldowns.any_signal_active(symbol) {
            let remaining_secs = [CooldownKind::OpenLong, CooldownKind::OpenShort]
                .iter()
                .filter_map(|k| self.cooldowns.remaining(symbol, *k))
                .map(|d| d.num_seconds())
                .max()
                .unwrap_or(0);
            debug!(symbol = %symbol, %trigger, remaining_secs, "debate skipped — cooldown active");
            return Err(DebateError::CooldownActive { symbol: symbol.clone(), remaining_secs });
        }

        match self.quota.tier() {
            QuotaTier::Exhausted if trigger != DebateTrigger::Manual => {
                debug!(symbol = %symbol, "debate skipped — quota exhausted");
                return Err(DebateError::QuotaExhausted {
                    tier: QuotaTier::Exhausted,
                    detail: "only manual debates allowed".to_string(),
                });
            }
            QuotaTier::Critical
                if trigger == DebateTrigger::Scheduled && !config.is_hot(symbol.raw()) =>
            {
                debug!(symbol = %symbol, "debate skipped — quota critical, cold symbol");
                return Err(DebateError::QuotaExhausted {
                    tier: QuotaTier::Critical,
                    detail: format!("{symbol} dropped outside the hot set"),
                });
            }
            _ => {}
        }

        // ── 2. Snapshot ─────────────────────────────────────────────────
        let fetch_started = Instant::now();
        let snapshot = self
            .snapshots
            .get(symbol)
            .await
            .map_err(|e| DebateError::SnapshotUnavailable(e.to_string()))?;
        let fetch_secs = fetch_started.elapsed().as_secs_f64();

        // The whole debate runs under one wall-clock budget; later stages
        // never get more than what the earlier stages left over.
        let debate_budget = Duration::from_secs(config.debate.debate_total_timeout_secs);
        let remaining_budget = |started: Instant| {
            debate_budget
                .saturating_sub(started.elapsed())
                .max(Duration::from_secs(5))
        };

        // ── 3. Role fan-out ─────────────────────────────────────────────
        let roles_started = Instant::now();
        let role_timeout = Duration::from_secs(config.debate.role_timeout_secs)
            .min(remaining_budget(debate_started));
        let chat_model = config.llm.chat_model.clone();

        let mut join_set = JoinSet::new();
        for role in self.panel.clone() {
            let provider = self.provider.clone();
            let quota = self.quota.clone();
            let messages = role_messages(&role, &snapshot);
            let model = chat_model.clone();
            let max_tokens = config.llm.max_tokens;
            let temperature = config.llm.temperature;

            join_set.spawn(async move {
                let call_started = Instant::now();
                let result = provider
                    .chat(&model, &messages, max_tokens, temperature, role_timeout)
                    .await;
                let latency_ms = call_started.elapsed().as_millis() as u64;

                match result {
                    Ok(reply) => {
                        quota.record(
                            &model,
                            reply.usage.prompt_tokens,
                            reply.usage.completion_tokens,
                            reply.latency_ms,
                            true,
                        );
                        let opinion = match parse_signal_text(&reply.content) {
                            Ok(parsed) => RoleOpinion {
                                name: role.name.clone(),
                                title: role.title.clone(),
                                emoji: role.emoji.clone(),
                                model_label: model,
                                signal: parsed.signal,
                                confidence: parsed.confidence,
                                analysis: if parsed.reason.is_empty() {
                                    reply.content.clone()
                                } else {
                                    parsed.reason
                                },
                                latency_ms,
                                input_messages: messages.clone(),
                            },
                            Err(e) => {
                                warn!(role = %role.name, error = %e, "role verdict unparseable — counted as HOLD");
                                RoleOpinion {
                                    name: role.name.clone(),
                                    title: role.title.clone(),
                                    emoji: role.emoji.clone(),
                                    model_label: model,
                                    signal: SignalKind::Hold,
                                    confidence: 0,
                                    analysis: reply.content.clone(),
                                    latency_ms,
                                    input_messages: messages.clone(),
                                }
                            }
                        };
                        (opinion, true)
                    }
                    Err(e) => {
                        quota.record(&model, 0, 0, latency_ms, false);
                        warn!(role = %role.name, error = %e, "role call failed — synthetic HOLD");
                        (
                            RoleOpinion::synthetic_hold(
                                &role.name,
                                &role.title,
                                &role.emoji,
                                &model,
                                e.to_string(),
                                latency_ms,
                                messages,
                            ),
                            false,
                        )
                    }
                }
            });
        }

        let mut role_opinions: Vec<RoleOpinion> = Vec::with_capacity(self.panel.len());
        let mut failed_roles = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((opinion, ok)) => {
                    if !ok {
                        failed_roles += 1;
                    }
                    role_opinions.push(opinion);
                }
                Err(e) => {
                    warn!(error = %e, "role task panicked — counted as failed");
                    failed_roles += 1;
                }
            }
        }

        if failed_roles >= self.panel.len() {
            return Err(DebateError::AllRolesFailed(self.panel.len()));
        }

        // Stable, role-name-sorted order in the emitted signal.
        role_opinions.sort_by(|a, b| a.name.cmp(&b.name));
        let roles_secs = roles_started.elapsed().as_secs_f64();

        // ── 4. Referee ──────────────────────────────────────────────────
        let referee_started = Instant::now();
        let referee_msgs = referee_messages(&snapshot, &role_opinions);
        let referee_timeout = Duration::from_secs(config.debate.referee_timeout_secs)
            .min(remaining_budget(debate_started));

        let referee_result = self
            .provider
            .chat(
                &config.llm.reasoner_model,
                &referee_msgs,
                config.llm.max_tokens,
                config.llm.temperature,
                referee_timeout,
            )
            .await;

        let mut error_text: Option<String> = (failed_roles > 0)
            .then(|| format!("{failed_roles}_roles_failed"));
        let mut final_raw_output = String::new();
        let mut parsed_by_fallback = false;

        let (kind, confidence, reason, risk_level, risk_assessment) = match referee_result {
            Ok(reply) => {
                self.quota.record(
                    &config.llm.reasoner_model,
                    reply.usage.prompt_tokens,
                    reply.usage.completion_tokens,
                    reply.latency_ms,
                    true,
                );
                final_raw_output = reply.content.clone();
                match parse_signal_text(&reply.content) {
                    Ok(parsed) => {
                        self.gate_stats.record_success(parsed.strategy);
                        parsed_by_fallback = parsed.parsed_by_fallback();
                        (
                            parsed.signal,
                            parsed.confidence,
                            parsed.reason,
                            parsed.risk_level,
                            parsed.risk_assessment.unwrap_or_default(),
                        )
                    }
                    Err(e) => {
                        self.gate_stats.record_reject();
                        warn!(symbol = %symbol, error = %e, "referee output rejected by schema gate — majority fallback");
                        error_text = Some("referee_failed_majority_fallback".to_string());
                        majority_fallback(&role_opinions)
                    }
                }
            }
            Err(e) => {
                self.quota
                    .record(&config.llm.reasoner_model, 0, 0, 0, false);
                warn!(symbol = %symbol, error = %e, "referee call failed — majority fallback");
                error_text = Some("referee_failed_majority_fallback".to_string());
                majority_fallback(&role_opinions)
            }
        };
        let referee_secs = referee_started.elapsed().as_secs_f64();

        // ── 5. Assemble + persist ───────────────────────────────────────
        let role_input_messages: Vec<Vec<ChatMessage>> = role_opinions
            .iter()
            .map(|o| o.input_messages.clone())
            .collect();

        let mut signal = Signal {
            id: 0,
            symbol: symbol.clone(),
            created_at: Utc::now().to_rfc3339(),
            signal: kind,
            confidence,
            risk_level,
            reason,
            risk_assessment,
            final_raw_output,
            role_opinions,
            role_input_messages,
            final_input_messages: referee_msgs,
            stage_timestamps: StageTimestamps {
                fetch: fetch_secs,
                roles: roles_secs,
                referee: referee_secs,
                total: debate_started.elapsed().as_secs_f64(),
            },
            price_at_signal: snapshot.mark_price,
            daily_quote: None,
            voice_text: None,
            error_text,
            parsed_by_fallback,
        };

        signal.id = self
            .store
            .insert_signal(&signal)
            .map_err(|e| DebateError::Storage(e.to_string()))?;

        info!(
            symbol = %symbol,
            %trigger,
            signal = %signal.signal,
            confidence = signal.confidence,
            id = signal.id,
            degraded = signal.error_text.is_some(),
            total_secs = signal.stage_timestamps.total,
            "debate complete"
        );

        // ── 6. Publish: broadcast first, executor second ────────────────
        let signal = Arc::new(signal);
        self.bus.emit_signal(signal.clone()).await;
        if signal.signal.is_actionable() {
            self.bus.emit_execute(signal.clone()).await;
        }

        // ── 7. Cooldown ─────────────────────────────────────────────────
        let cooldown_kind = match signal.signal {
            SignalKind::Buy => Some(CooldownKind::OpenLong),
            SignalKind::Short => Some(CooldownKind::OpenShort),
            _ => None,
        };
        if let Some(kind) = cooldown_kind {
            self.cooldowns.arm(
                symbol,
                kind,
                chrono::Duration::seconds(config.debate.signal_cooldown_secs as i64),
            );
        }

        Ok(signal)
    }
}

/// Majority vote over non-HOLD role opinions. Ties fall to HOLD; confidence
/// is the median of the majority side.
fn majority_fallback(
    opinions: &[RoleOpinion],
) -> (SignalKind, u8, String, RiskLevel, String) {
    use std::collections::HashMap;

    let mut votes: HashMap<SignalKind, Vec<u8>> = HashMap::new();
    for opinion in opinions.iter().filter(|o| o.signal != SignalKind::Hold) {
        votes.entry(opinion.signal).or_default().push(opinion.confidence);
    }

    let best = votes.iter().max_by_key(|(_, v)| v.len());
    let (kind, confidence) = match best {
        Some((kind, confidences)) => {
            let top = confidences.len();
            let tied = votes.values().filter(|v| v.len() == top).count() > 1;
            if tied {
                (SignalKind::Hold, 0)
            } else {
                let mut sorted = confidences.clone();
                sorted.sort_unstable();
                let median = if sorted.len() % 2 == 1 {
                    sorted[sorted.len() / 2]
                } else {
                    ((sorted[sorted.len() / 2 - 1] as u16 + sorted[sorted.len() / 2] as u16) / 2)
                        as u8
                };
                (*kind, median)
            }
        }
        None => (SignalKind::Hold, 0),
    };

    (
        kind,
        confidence,
        format!("裁判失败，按多数派观点回退: {kind}"),
        RiskLevel::default(),
        String::new(),
    )
}

impl std::fmt::Debug for DebateOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebateOrchestrator")
            .field("panel", &self.panel.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
