//! The per-call conversation loop
//!
//! Once media is up (either direction) the loop runs: greet, attach the
//! audio fork, then cycle listen -> transcribe -> think -> speak until the
//! turn budget is spent, the caller goes quiet, or the dialog tears down.
//!
//! Failure policy is driven by the error classification
//! (`is_recoverable()` on the speech and engine error types): recoverable
//! faults keep the call alive - chain failures fall back, an AI failure
//! (after the bridge's internal retry) gets a spoken apology, and several
//! consecutive AI failures end the call with `ai_unavailable` - while an
//! unrecoverable fault ends the call at once. Everything here is
//! cooperatively cancellable through the session's token.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxbridge_media_core::fork::ForkExpectations;
use voxbridge_speech_core::{AiBridge, SttChain, TtsChain, TtsRequest};

use crate::device::Device;
use crate::error::Result;
use crate::media::MediaEndpoint;
use crate::session::{CallState, FailReason, SessionHandle};

/// Everything the loop speaks and hears through
pub struct SpeechStack {
    pub tts: Arc<TtsChain>,
    pub stt: Arc<SttChain>,
    pub ai: Arc<AiBridge>,
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Turn budget per call
    pub max_turns: u32,
    /// How long to wait for the next utterance before prompting
    pub utterance_timeout: Duration,
    /// Let the caller interrupt bot playback
    pub barge_in: bool,
    /// Consecutive AI failures before giving up on the call
    pub ai_failure_limit: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            utterance_timeout: Duration::from_secs(20),
            barge_in: false,
            ai_failure_limit: 3,
        }
    }
}

/// Neutral spoken apology when the AI cannot answer
fn apology(language: &str) -> &'static str {
    match language {
        "he" => "סליחה, נתקלתי בבעיה. אפשר לנסות שוב?",
        "ar" => "عذراً، واجهت مشكلة. حاول مرة أخرى من فضلك.",
        "ru" => "Извините, возникла проблема. Попробуйте ещё раз.",
        "fr" => "Désolé, j'ai rencontré un problème. Pouvez-vous réessayer ?",
        "es" => "Lo siento, tuve un problema. ¿Puede intentarlo de nuevo?",
        _ => "Sorry, I ran into a problem. Could you try again?",
    }
}

/// Short re-prompt after a quiet spell
fn still_there(language: &str) -> &'static str {
    match language {
        "he" => "אתם עדיין שם?",
        "ar" => "هل ما زلت معي؟",
        "ru" => "Вы ещё здесь?",
        "fr" => "Vous êtes toujours là ?",
        "es" => "¿Sigue ahí?",
        _ => "Are you still there?",
    }
}

/// Synthesize and play one line, cancellable. TTS chain failure is returned;
/// playback interruption is not an error.
async fn speak(
    endpoint: &dyn MediaEndpoint,
    speech: &SpeechStack,
    device: &Device,
    text: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let request = TtsRequest {
        text: text.to_string(),
        language: device.language.clone(),
        voice_id: device.voice_id.clone(),
    };
    let audio = speech.tts.synthesize(&request).await?;

    tokio::select! {
        result = endpoint.play(&audio.url) => result,
        _ = cancel.cancelled() => {
            endpoint.cancel_playback();
            Ok(())
        }
    }
}

/// Announce mode: speak the message, then done. The caller completes the
/// session and hangs up.
pub async fn run_announce(
    session: &SessionHandle,
    device: &Device,
    endpoint: &dyn MediaEndpoint,
    message: &str,
    speech: &SpeechStack,
) -> Result<()> {
    let cancel = session.cancellation();
    session.transition(CallState::Speaking).await?;
    speak(endpoint, speech, device, message, &cancel).await?;
    info!(call_id = %session.id, "announcement played");
    Ok(())
}

/// Full conversation loop. Returns when the call should end; the caller owns
/// teardown and the terminal transition.
pub async fn run_conversation(
    session: &SessionHandle,
    device: &Device,
    endpoint: &dyn MediaEndpoint,
    expectations: &ForkExpectations,
    fork_ws_url: &str,
    greeting: &str,
    speech: &SpeechStack,
    config: &ConversationConfig,
) -> Result<()> {
    let cancel = session.cancellation();
    let call_id = session.id.to_string();

    // Greeting plays before the fork is attached, so nothing is captured yet.
    session.transition(CallState::Speaking).await?;
    if let Err(e) = speak(endpoint, speech, device, greeting, &cancel).await {
        if !e.is_recoverable() {
            return Err(e);
        }
        warn!(call_id = %session.id, "greeting failed, continuing: {}", e);
    }
    if cancel.is_cancelled() {
        return Ok(());
    }

    // Expectation goes in before the fork command so the engine cannot
    // connect faster than we can look for it.
    let ticket = expectations.expect(&call_id);
    endpoint.fork_audio(fork_ws_url, &call_id).await?;
    let waited = tokio::select! {
        got = ticket.wait() => got,
        _ = cancel.cancelled() => return Ok(()),
    };
    let mut fork = match waited {
        Ok(handle) => handle,
        Err(e) => {
            // Non-fatal: the call continues without caller audio
            warn!(call_id = %session.id, "no audio fork attached: {}", e);
            session.transition(CallState::Listening).await?;
            cancel.cancelled().await;
            return Ok(());
        }
    };

    session.transition(CallState::Listening).await?;

    let mut turns: u32 = 0;
    let mut quiet_spells: u32 = 0;
    let mut ai_failures: u32 = 0;
    let mut pending = None;

    while turns < config.max_turns {
        fork.set_capture(true);

        let utterance = match pending.take() {
            Some(utterance) => Some(utterance),
            None => {
                tokio::select! {
                    got = tokio::time::timeout(config.utterance_timeout, fork.next_utterance()) => {
                        match got {
                            Ok(Some(utterance)) => Some(utterance),
                            Ok(None) => {
                                debug!(call_id = %session.id, "fork closed, ending conversation");
                                return Ok(());
                            }
                            Err(_) => None,
                        }
                    }
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        };

        let Some(utterance) = utterance else {
            // Quiet spell: prompt once, hang up on the second in a row
            quiet_spells += 1;
            if quiet_spells >= 2 {
                info!(call_id = %session.id, "caller went quiet, ending call");
                return Ok(());
            }
            if !config.barge_in {
                fork.set_capture(false);
            }
            session.transition(CallState::Speaking).await?;
            if let Err(e) = speak(endpoint, speech, device, still_there(&device.language), &cancel).await {
                if !e.is_recoverable() {
                    return Err(e);
                }
            }
            session.transition(CallState::Listening).await?;
            continue;
        };
        quiet_spells = 0;

        if !config.barge_in {
            fork.set_capture(false);
        }

        let transcript = match speech
            .stt
            .transcribe(&utterance.pcm, utterance.sample_rate, &device.language)
            .await
        {
            Ok(text) => text,
            Err(e) if e.is_recoverable() => {
                warn!(call_id = %session.id, "transcription failed, listening again: {}", e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if transcript.trim().is_empty() {
            debug!(call_id = %session.id, "empty transcript, listening again");
            continue;
        }
        info!(call_id = %session.id, turn = turns + 1, "caller: {}", transcript);

        // Thinking phrase and the AI turn run concurrently; the phrase is
        // best-effort cover audio for gateway latency.
        let device_prompt =
            (!device.personality.is_empty()).then(|| device.personality.as_str());
        let (_, reply) = tokio::join!(
            speak(endpoint, speech, device, &device.thinking_phrase, &cancel),
            speech.ai.ask(&transcript, Some(&call_id), device_prompt),
        );
        if cancel.is_cancelled() {
            return Ok(());
        }

        match reply {
            Ok(answer) => {
                ai_failures = 0;
                session.transition(CallState::Speaking).await?;

                if config.barge_in {
                    // Caller may cut the reply short; the interrupting
                    // utterance feeds the next turn.
                    tokio::select! {
                        result = speak(endpoint, speech, device, &answer, &cancel) => {
                            if let Err(e) = result {
                                if !e.is_recoverable() {
                                    return Err(e);
                                }
                                warn!(call_id = %session.id, "reply synthesis failed: {}", e);
                            }
                        }
                        interrupting = fork.next_utterance() => {
                            endpoint.cancel_playback();
                            pending = interrupting;
                        }
                    }
                } else if let Err(e) = speak(endpoint, speech, device, &answer, &cancel).await {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                    warn!(call_id = %session.id, "reply synthesis failed: {}", e);
                }

                session.record_turn(transcript, answer);
                turns += 1;
                session.transition(CallState::Listening).await?;
            }
            Err(e) if e.is_recoverable() => {
                ai_failures += 1;
                warn!(call_id = %session.id, failures = ai_failures, "ai turn failed: {}", e);
                if ai_failures >= config.ai_failure_limit {
                    session.fail(FailReason::AiUnavailable).await;
                    return Ok(());
                }
                session.transition(CallState::Speaking).await?;
                if let Err(e) = speak(endpoint, speech, device, apology(&device.language), &cancel).await {
                    if !e.is_recoverable() {
                        return Err(e);
                    }
                }
                session.transition(CallState::Listening).await?;
            }
            Err(e) => {
                warn!(call_id = %session.id, "unrecoverable ai failure: {}", e);
                session.fail(FailReason::AiUnavailable).await;
                return Ok(());
            }
        }
    }

    info!(call_id = %session.id, turns, "turn budget spent, ending call");
    Ok(())
}
