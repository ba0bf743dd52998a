//! Turn pipeline worker.
//!
//! One worker per session, looping over conversational turns:
//!
//! ```text
//! ingest queue ─▸ recognition client ─▸ final transcript
//!                                          │
//!                         generation stream (tokens)
//!                              │                │
//!                        llm_token events   segmenter ─▸ synthesis ─▸ audio
//! ```
//!
//! Generation and synthesis overlap: the generation stream keeps filling
//! its channel while an earlier sentence is being synthesized, and
//! awaiting each sentence's relay sequentially keeps audio in segmenter
//! order. A turn degrades (apology, skipped sentence, error event) but
//! the session only ends when the ingest queue closes.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::asr::{AsrEvent, AsrTurn, Transcriber};
use crate::llm::{ChatMessage, ChatProvider, TokenChunk};
use crate::tts::{SentenceSegmenter, Synthesizer};

use super::events::{IngestItem, Outbound, ServerEvent};

// ── Configuration ────────────────────────────────────────────────

/// Per-session pipeline settings.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Spoken when a turn's final transcript is empty.
    pub apology_text: String,
    /// Conversation history cap, in messages; oldest dropped first.
    pub max_history_messages: usize,
    /// Segmenter length threshold, in characters.
    pub segment_max_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            apology_text: "抱歉，我没有听清，请再说一遍。".into(),
            max_history_messages: 20,
            segment_max_chars: 50,
        }
    }
}

async fn emit(outbound: &mpsc::Sender<Outbound>, event: ServerEvent) {
    let _ = outbound.send(Outbound::Event(event)).await;
}

// ── Worker ───────────────────────────────────────────────────────

/// Sequences recognition → generation → synthesis for one session.
pub struct TurnWorker {
    transcriber: Arc<dyn Transcriber>,
    chat: Arc<dyn ChatProvider>,
    synthesizer: Arc<dyn Synthesizer>,
    ingest: mpsc::Receiver<IngestItem>,
    outbound: mpsc::Sender<Outbound>,
    identity: String,
    config: TurnConfig,
    history: Vec<ChatMessage>,
}

impl TurnWorker {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        chat: Arc<dyn ChatProvider>,
        synthesizer: Arc<dyn Synthesizer>,
        ingest: mpsc::Receiver<IngestItem>,
        outbound: mpsc::Sender<Outbound>,
        identity: String,
        config: TurnConfig,
    ) -> Self {
        Self {
            transcriber,
            chat,
            synthesizer,
            ingest,
            outbound,
            identity,
            config,
            history: Vec::new(),
        }
    }

    /// Run until the ingest queue closes.
    pub async fn run(mut self) {
        loop {
            // WaitingForAudio: an end marker with no preceding audio is
            // turn-boundary noise, not a turn
            let first_chunk = match self.ingest.recv().await {
                None => break,
                Some(IngestItem::EndOfTurn) => continue,
                Some(IngestItem::Chunk(chunk)) => chunk,
            };

            self.run_turn(first_chunk).await;
            emit(&self.outbound, ServerEvent::TurnEnd).await;

            if self.outbound.is_closed() {
                break;
            }
        }
        tracing::debug!(identity = %self.identity, "pipeline worker stopped");
    }

    async fn run_turn(&mut self, first_chunk: Vec<u8>) {
        let Some(transcript) = self.transcribe(first_chunk).await else {
            return;
        };

        if transcript.is_empty() {
            // silence is recovered, not failed: speak a fixed apology,
            // which the synthesis cache makes cheap
            tracing::info!(identity = %self.identity, "empty transcript, speaking apology");
            let apology = self.config.apology_text.clone();
            self.speak(&apology).await;
            return;
        }

        self.generate_and_speak(&transcript).await;
    }

    // ── Transcribing ──────────────────────────────────────────────

    /// Drive one recognition turn: feed queued audio until the end
    /// marker, relay partials, return the final transcript. `None`
    /// means the turn failed and an error event was already emitted.
    async fn transcribe(&mut self, first_chunk: Vec<u8>) -> Option<String> {
        let turn = match self.transcriber.start_turn(&self.identity).await {
            Ok(turn) => turn,
            Err(e) => {
                tracing::error!(identity = %self.identity, error = %e, "failed to start recognition turn");
                emit(
                    &self.outbound,
                    ServerEvent::Error {
                        message: format!("recognition unavailable: {e}"),
                    },
                )
                .await;
                self.discard_until_turn_end().await;
                return None;
            }
        };

        let AsrTurn { sender, mut events } = turn;
        if let Err(e) = sender.send_audio(first_chunk).await {
            tracing::warn!(error = %e, "recognition turn rejected first chunk");
        }

        let mut sending = true;
        let mut outcome: Option<Option<String>> = None;

        while outcome.is_none() {
            tokio::select! {
                item = self.ingest.recv(), if sending => {
                    match item {
                        Some(IngestItem::Chunk(chunk)) => {
                            if sender.send_audio(chunk).await.is_err() {
                                sending = false;
                            }
                        }
                        Some(IngestItem::EndOfTurn) | None => {
                            let _ = sender.finish().await;
                            sending = false;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(AsrEvent::Partial { text }) => {
                            emit(&self.outbound, ServerEvent::AsrPartial { text }).await;
                        }
                        Some(AsrEvent::Final { text }) => {
                            emit(&self.outbound, ServerEvent::AsrFinal { text: text.clone() }).await;
                            outcome = Some(Some(text));
                        }
                        Some(AsrEvent::Error { message }) => {
                            emit(&self.outbound, ServerEvent::Error { message }).await;
                            outcome = Some(None);
                        }
                        None => {
                            emit(
                                &self.outbound,
                                ServerEvent::Error {
                                    message: "recognition stream ended unexpectedly".into(),
                                },
                            )
                            .await;
                            outcome = Some(None);
                        }
                    }
                }
            }
        }

        if sending {
            // recognition finished before the client's end marker;
            // discard the rest of this utterance so it cannot leak into
            // the next turn
            self.discard_until_turn_end().await;
        }
        outcome.flatten()
    }

    /// Swallow queued audio up to (and including) the next end marker.
    async fn discard_until_turn_end(&mut self) {
        loop {
            match self.ingest.recv().await {
                Some(IngestItem::Chunk(_)) => continue,
                Some(IngestItem::EndOfTurn) | None => break,
            }
        }
    }

    // ── Generating + synthesizing ─────────────────────────────────

    async fn generate_and_speak(&mut self, transcript: &str) {
        let mut stream = match self.chat.chat_stream(&self.history, transcript).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(identity = %self.identity, error = %e, "generation request failed");
                emit(
                    &self.outbound,
                    ServerEvent::Error {
                        message: format!("generation failed: {e}"),
                    },
                )
                .await;
                return;
            }
        };

        let mut segmenter = SentenceSegmenter::new(self.config.segment_max_chars);
        let mut assistant_text = String::new();
        let mut failed = false;

        while let Some(chunk) = stream.next_chunk().await {
            match chunk {
                TokenChunk::Token(token) => {
                    emit(
                        &self.outbound,
                        ServerEvent::LlmToken {
                            text: token.clone(),
                        },
                    )
                    .await;
                    assistant_text.push_str(&token);
                    if let Some(sentence) = segmenter.push(&token) {
                        self.speak(&sentence).await;
                    }
                }
                TokenChunk::Done => break,
                TokenChunk::Error(message) => {
                    // abort the rest of the turn; audio already sent
                    // stays sent, the unfinished fragment is never
                    // synthesized
                    tracing::error!(identity = %self.identity, error = %message, "generation stream failed");
                    emit(&self.outbound, ServerEvent::Error { message }).await;
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            return;
        }

        if let Some(tail) = segmenter.finish() {
            self.speak(&tail).await;
        }

        self.history.push(ChatMessage::user(transcript));
        self.history.push(ChatMessage::assistant(assistant_text));
        if self.history.len() > self.config.max_history_messages {
            let excess = self.history.len() - self.config.max_history_messages;
            self.history.drain(..excess);
        }
    }

    /// Synthesize one sentence and relay its audio, in order. A failed
    /// sentence is logged and skipped; the turn moves on.
    async fn speak(&self, text: &str) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(16);
        let synth = self.synthesizer.synthesize(text, tx);
        let relay = async {
            while let Some(chunk) = rx.recv().await {
                if self.outbound.send(Outbound::Audio(chunk)).await.is_err() {
                    break;
                }
            }
        };
        let (result, ()) = tokio::join!(synth, relay);
        if let Err(e) = result {
            tracing::warn!(
                identity = %self.identity,
                error = %e,
                text_chars = text.chars().count(),
                "sentence synthesis failed, continuing turn"
            );
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::AsrInput;
    use crate::errors::{AsrError, GenerationError, SynthesisError};
    use crate::llm::TokenStream;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Scripted fakes ────────────────────────────────────────────

    struct ScriptedAsr {
        started: Arc<AtomicUsize>,
        script: Vec<AsrEvent>,
    }

    impl ScriptedAsr {
        fn finishing_with(text: &str) -> (Self, Arc<AtomicUsize>) {
            let started = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    started: Arc::clone(&started),
                    script: vec![AsrEvent::Final { text: text.into() }],
                },
                started,
            )
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedAsr {
        async fn start_turn(&self, _uid: &str) -> Result<AsrTurn, AsrError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let (audio_tx, mut audio_rx) = mpsc::channel(16);
            let (event_tx, event_rx) = mpsc::channel(16);
            let script = self.script.clone();
            tokio::spawn(async move {
                while let Some(input) = audio_rx.recv().await {
                    if matches!(input, AsrInput::Finish) {
                        break;
                    }
                }
                for event in script {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
            Ok(AsrTurn::new(audio_tx, event_rx))
        }
    }

    struct ScriptedChat {
        chunks: Vec<TokenChunk>,
        history_lens: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedChat {
        fn yielding(chunks: Vec<TokenChunk>) -> (Self, Arc<Mutex<Vec<usize>>>) {
            let history_lens = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    chunks,
                    history_lens: Arc::clone(&history_lens),
                },
                history_lens,
            )
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedChat {
        async fn chat_stream(
            &self,
            history: &[ChatMessage],
            _user_text: &str,
        ) -> Result<TokenStream, GenerationError> {
            self.history_lens.lock().push(history.len());
            let (tx, stream) = TokenStream::channel();
            for chunk in self.chunks.clone() {
                let _ = tx.send(chunk);
            }
            Ok(stream)
        }

        async fn chat_once(
            &self,
            _history: &[ChatMessage],
            _user_text: &str,
        ) -> Result<String, GenerationError> {
            Ok(String::new())
        }
    }

    struct RecordingSynth {
        calls: Arc<Mutex<Vec<String>>>,
        /// Sentences containing this marker fail.
        poison: Option<String>,
    }

    impl RecordingSynth {
        fn ok() -> (Self, Arc<Mutex<Vec<String>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    calls: Arc::clone(&calls),
                    poison: None,
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Synthesizer for RecordingSynth {
        async fn synthesize(
            &self,
            text: &str,
            sink: mpsc::Sender<Vec<u8>>,
        ) -> Result<(), SynthesisError> {
            self.calls.lock().push(text.to_string());
            if let Some(poison) = &self.poison {
                if text.contains(poison.as_str()) {
                    return Err(SynthesisError::Status {
                        status: 500,
                        message: "synthesis exploded".into(),
                    });
                }
            }
            let _ = sink.send(vec![0xAA, 0xBB]).await;
            Ok(())
        }
    }

    // ── Harness ───────────────────────────────────────────────────

    async fn run_pipeline(
        transcriber: Arc<dyn Transcriber>,
        chat: Arc<dyn ChatProvider>,
        synthesizer: Arc<dyn Synthesizer>,
        inputs: Vec<IngestItem>,
    ) -> Vec<Outbound> {
        let (ingest_tx, ingest_rx) = mpsc::channel(64);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(256);
        let worker = TurnWorker::new(
            transcriber,
            chat,
            synthesizer,
            ingest_rx,
            outbound_tx,
            "tester".into(),
            TurnConfig::default(),
        );
        let handle = tokio::spawn(worker.run());
        for item in inputs {
            ingest_tx.send(item).await.unwrap();
        }
        drop(ingest_tx);
        handle.await.unwrap();

        let mut out = Vec::new();
        while let Ok(item) = outbound_rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn event(e: ServerEvent) -> Outbound {
        Outbound::Event(e)
    }

    fn audio() -> Outbound {
        Outbound::Audio(vec![0xAA, 0xBB])
    }

    // ── Cases ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn end_marker_without_audio_is_a_no_op_turn() {
        let (asr, started) = ScriptedAsr::finishing_with("ignored");
        let (chat, _) = ScriptedChat::yielding(vec![]);
        let (synth, synth_calls) = RecordingSynth::ok();

        let outputs = run_pipeline(
            Arc::new(asr),
            Arc::new(chat),
            Arc::new(synth),
            vec![IngestItem::EndOfTurn, IngestItem::EndOfTurn],
        )
        .await;

        assert!(outputs.is_empty(), "no events for a no-op turn: {outputs:?}");
        assert_eq!(started.load(Ordering::SeqCst), 0, "no handshake started");
        assert!(synth_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_mid_stream_aborts_cleanly() {
        let started = Arc::new(AtomicUsize::new(0));
        let asr = ScriptedAsr {
            started,
            script: vec![
                AsrEvent::Partial { text: "讲个".into() },
                AsrEvent::Final { text: "讲个笑话".into() },
            ],
        };
        let (chat, _) = ScriptedChat::yielding(vec![
            TokenChunk::Token("从前".into()),
            TokenChunk::Error("generation backend disconnected".into()),
        ]);
        let (synth, synth_calls) = RecordingSynth::ok();

        let outputs = run_pipeline(
            Arc::new(asr),
            Arc::new(chat),
            Arc::new(synth),
            vec![IngestItem::Chunk(vec![1, 2, 3]), IngestItem::EndOfTurn],
        )
        .await;

        assert_eq!(
            outputs,
            vec![
                event(ServerEvent::AsrPartial { text: "讲个".into() }),
                event(ServerEvent::AsrFinal { text: "讲个笑话".into() }),
                event(ServerEvent::LlmToken { text: "从前".into() }),
                event(ServerEvent::Error {
                    message: "generation backend disconnected".into()
                }),
                event(ServerEvent::TurnEnd),
            ]
        );
        assert!(
            synth_calls.lock().is_empty(),
            "the unfinished fragment must not be synthesized"
        );
    }

    #[tokio::test]
    async fn empty_transcript_speaks_the_apology() {
        let (asr, _) = ScriptedAsr::finishing_with("");
        let (chat, chat_calls) = ScriptedChat::yielding(vec![]);
        let (synth, synth_calls) = RecordingSynth::ok();

        let outputs = run_pipeline(
            Arc::new(asr),
            Arc::new(chat),
            Arc::new(synth),
            vec![IngestItem::Chunk(vec![0; 8]), IngestItem::EndOfTurn],
        )
        .await;

        assert_eq!(
            outputs,
            vec![
                event(ServerEvent::AsrFinal { text: String::new() }),
                audio(),
                event(ServerEvent::TurnEnd),
            ]
        );
        assert!(chat_calls.lock().is_empty(), "no generation for silence");
        assert_eq!(
            *synth_calls.lock(),
            vec![TurnConfig::default().apology_text]
        );
    }

    #[tokio::test]
    async fn sentences_stream_in_order_and_history_accumulates() {
        let (asr, _) = ScriptedAsr::finishing_with("讲个笑话");
        let (chat, history_lens) = ScriptedChat::yielding(vec![
            TokenChunk::Token("你".into()),
            TokenChunk::Token("好。".into()),
            TokenChunk::Token("OK".into()),
            TokenChunk::Done,
        ]);
        let (synth, synth_calls) = RecordingSynth::ok();

        let turn = vec![IngestItem::Chunk(vec![9; 4]), IngestItem::EndOfTurn];
        let mut inputs = turn.clone();
        inputs.extend(turn);

        let outputs = run_pipeline(Arc::new(asr), Arc::new(chat), Arc::new(synth), inputs).await;

        let one_turn = vec![
            event(ServerEvent::AsrFinal { text: "讲个笑话".into() }),
            event(ServerEvent::LlmToken { text: "你".into() }),
            event(ServerEvent::LlmToken { text: "好。".into() }),
            audio(),
            event(ServerEvent::LlmToken { text: "OK".into() }),
            audio(),
            event(ServerEvent::TurnEnd),
        ];
        let mut expected = one_turn.clone();
        expected.extend(one_turn);
        assert_eq!(outputs, expected);

        assert_eq!(*synth_calls.lock(), vec!["你好。", "OK", "你好。", "OK"]);
        // second turn sees the first turn's user+assistant messages
        assert_eq!(*history_lens.lock(), vec![0, 2]);
    }

    #[tokio::test]
    async fn failed_sentence_synthesis_skips_to_the_next() {
        let (asr, _) = ScriptedAsr::finishing_with("说两句");
        let (chat, _) = ScriptedChat::yielding(vec![
            TokenChunk::Token("坏句。".into()),
            TokenChunk::Token("好句。".into()),
            TokenChunk::Done,
        ]);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let synth = RecordingSynth {
            calls: Arc::clone(&calls),
            poison: Some("坏".into()),
        };

        let outputs = run_pipeline(
            Arc::new(asr),
            Arc::new(chat),
            Arc::new(synth),
            vec![IngestItem::Chunk(vec![7; 4]), IngestItem::EndOfTurn],
        )
        .await;

        // both sentences attempted, only the second produced audio,
        // and the turn still ended normally
        assert_eq!(*calls.lock(), vec!["坏句。", "好句。"]);
        let audio_frames = outputs
            .iter()
            .filter(|o| matches!(o, Outbound::Audio(_)))
            .count();
        assert_eq!(audio_frames, 1);
        assert_eq!(outputs.last(), Some(&event(ServerEvent::TurnEnd)));
    }

    #[tokio::test]
    async fn recognition_error_still_ends_the_turn() {
        let asr = ScriptedAsr {
            started: Arc::new(AtomicUsize::new(0)),
            script: vec![AsrEvent::Error {
                message: "quota exhausted".into(),
            }],
        };
        let (chat, chat_calls) = ScriptedChat::yielding(vec![]);
        let (synth, _) = RecordingSynth::ok();

        let outputs = run_pipeline(
            Arc::new(asr),
            Arc::new(chat),
            Arc::new(synth),
            vec![IngestItem::Chunk(vec![1]), IngestItem::EndOfTurn],
        )
        .await;

        assert_eq!(
            outputs,
            vec![
                event(ServerEvent::Error {
                    message: "quota exhausted".into()
                }),
                event(ServerEvent::TurnEnd),
            ]
        );
        assert!(chat_calls.lock().is_empty());
    }
}
