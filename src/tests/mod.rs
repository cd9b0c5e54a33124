use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use candle_core::{Device, Tensor};

use crate::{
    config::GenerationConfig,
    decoding::{get_encoded_results, DecodingError, DecodingInputs},
    model_executor::{
        ComputeEngine, EngineError, InputsEmbedder, TurnInputs, ATTENTION_MASK, BEAM_IDX,
        INPUTS_EMBEDS, INPUT_IDS, LOGITS,
    },
    pipeline::VlmPipeline,
    sampler::{GreedySampler, Sampler, SamplerError},
    sequence::{FinishReason, SequenceGroup, SyncSequenceGroup},
    types::{ReadLock, RequestId, SequenceId, TokenId, WriteLock},
};

const VOCAB_SIZE: usize = 32;
const HIDDEN_SIZE: usize = 4;
const IMAGE_TOKEN_ID: TokenId = 29;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Everything the mock engine observed, shared with the test body.
#[derive(Debug, Default)]
struct EngineRecorder {
    beam_idx_history: Vec<Vec<u32>>,
    trim_calls: Vec<usize>,
    num_resets: usize,
}

/// Deterministic stand-in for the compute engine.
///
/// The internal cache is the list of tokens committed per row. Every `infer`
/// reorders the cache rows by the bound beam indices, appends the fed tokens,
/// checks that the bound attention mask length matches the cache length, and
/// emits logits whose argmax at any position holding token `t` is
/// `(t + 1) % VOCAB_SIZE`.
struct MockEngine {
    tensors: HashMap<String, Tensor>,
    cache: Vec<Vec<TokenId>>,
    recorder: Arc<Mutex<EngineRecorder>>,
}

impl MockEngine {
    fn new() -> (Self, Arc<Mutex<EngineRecorder>>) {
        let recorder = Arc::new(Mutex::new(EngineRecorder::default()));
        (
            Self {
                tensors: HashMap::new(),
                cache: vec![],
                recorder: recorder.clone(),
            },
            recorder,
        )
    }

    fn fed_tokens(&self) -> Result<Vec<Vec<TokenId>>, EngineError> {
        if let Some(embeds) = self.tensors.get(INPUTS_EMBEDS) {
            let rows = embeds.to_vec3::<f32>()?;
            Ok(rows
                .iter()
                .map(|row| row.iter().map(|position| position[0] as TokenId).collect())
                .collect())
        } else if let Some(ids) = self.tensors.get(INPUT_IDS) {
            Ok(ids.to_vec2::<TokenId>()?)
        } else {
            Err(EngineError::MissingTensor(INPUT_IDS.into()))
        }
    }
}

impl ComputeEngine for MockEngine {
    fn set_tensor(&mut self, name: &str, tensor: Tensor) -> Result<(), EngineError> {
        self.tensors.insert(name.to_string(), tensor);
        Ok(())
    }

    fn get_tensor(&self, name: &str) -> Result<Tensor, EngineError> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::MissingTensor(name.to_string()))
    }

    fn infer(&mut self) -> Result<(), EngineError> {
        let fed = self.fed_tokens()?;
        let beam_idx = self
            .tensors
            .get(BEAM_IDX)
            .ok_or_else(|| EngineError::MissingTensor(BEAM_IDX.into()))?
            .to_vec1::<u32>()?;
        if beam_idx.len() != fed.len() {
            return Err(EngineError::InvalidShape {
                name: BEAM_IDX.into(),
                message: format!("{} beams for {} input rows", beam_idx.len(), fed.len()),
            });
        }
        self.recorder
            .lock()
            .map_err(|e| EngineError::ExecutionError(e.to_string()))?
            .beam_idx_history
            .push(beam_idx.clone());

        let mut new_cache = Vec::with_capacity(fed.len());
        for (row, &source) in fed.iter().zip(beam_idx.iter()) {
            let mut tokens = self.cache.get(source as usize).cloned().unwrap_or_default();
            tokens.extend_from_slice(row);
            new_cache.push(tokens);
        }
        self.cache = new_cache;

        // Positional alignment: the bound mask must describe exactly the
        // cache the model would attend over.
        let (mask_rows, mask_cols) = self
            .tensors
            .get(ATTENTION_MASK)
            .ok_or_else(|| EngineError::MissingTensor(ATTENTION_MASK.into()))?
            .dims2()?;
        for tokens in &self.cache {
            if mask_rows != self.cache.len() || mask_cols != tokens.len() {
                return Err(EngineError::ExecutionError(format!(
                    "mask ({mask_rows}, {mask_cols}) misaligned with cache of {} rows x {} tokens",
                    self.cache.len(),
                    tokens.len()
                )));
            }
        }

        let num_rows = fed.len();
        let seq_len = fed[0].len();
        let mut logits = vec![0f32; num_rows * seq_len * VOCAB_SIZE];
        for (row_idx, row) in fed.iter().enumerate() {
            for (pos, &token) in row.iter().enumerate() {
                let target = (token as usize + 1) % VOCAB_SIZE;
                logits[(row_idx * seq_len + pos) * VOCAB_SIZE + target] = 8.0;
            }
        }
        self.tensors.insert(
            LOGITS.to_string(),
            Tensor::from_vec(logits, (num_rows, seq_len, VOCAB_SIZE), &Device::Cpu)?,
        );
        Ok(())
    }

    fn reset_state(&mut self) -> Result<(), EngineError> {
        self.cache.clear();
        self.tensors.clear();
        self.recorder
            .lock()
            .map_err(|e| EngineError::ExecutionError(e.to_string()))?
            .num_resets += 1;
        Ok(())
    }

    fn trim_cache(&mut self, seq_len_axis: usize, count: usize) -> Result<(), EngineError> {
        if seq_len_axis != crate::pipeline::KV_CACHE_SEQ_LENGTH_AXIS {
            return Err(EngineError::ExecutionError(format!(
                "unexpected trim axis {seq_len_axis}"
            )));
        }
        self.recorder
            .lock()
            .map_err(|e| EngineError::ExecutionError(e.to_string()))?
            .trim_calls
            .push(count);
        for tokens in &mut self.cache {
            if count > tokens.len() {
                return Err(EngineError::ExecutionError(format!(
                    "trim of {count} exceeds cached length {}",
                    tokens.len()
                )));
            }
            tokens.truncate(tokens.len() - count);
        }
        Ok(())
    }
}

/// Mock embedding collaborator. The "tokenizer" reads whitespace-separated
/// numeric tokens; each image contributes one image token ahead of the text.
/// A token embeds as its id broadcast over the hidden dimension, so the mock
/// engine can recover it.
#[derive(Default)]
struct MockEmbedder {
    last_prefix: Vec<TokenId>,
}

fn embed(token_ids: &[TokenId], device: &Device) -> Result<Tensor, EngineError> {
    let flat: Vec<f32> = token_ids
        .iter()
        .flat_map(|&t| std::iter::repeat(t as f32).take(HIDDEN_SIZE))
        .collect();
    Ok(Tensor::from_vec(
        flat,
        (1, token_ids.len(), HIDDEN_SIZE),
        device,
    )?)
}

impl InputsEmbedder for MockEmbedder {
    fn get_inputs_embeds(
        &mut self,
        prompt: &str,
        images: &[Tensor],
        prefix_tokens: &[TokenId],
    ) -> Result<TurnInputs, EngineError> {
        self.last_prefix = prefix_tokens.to_vec();
        let mut token_ids = prefix_tokens.to_vec();
        token_ids.extend(std::iter::repeat(IMAGE_TOKEN_ID).take(images.len()));
        token_ids.extend(
            prompt
                .split_whitespace()
                .filter_map(|word| word.parse::<TokenId>().ok()),
        );
        let inputs_embeds = embed(&token_ids, &Device::Cpu)?;
        Ok(TurnInputs {
            inputs_embeds,
            token_ids,
        })
    }

    fn infer(&mut self, token_ids: &Tensor) -> Result<Tensor, EngineError> {
        let rows = token_ids.to_vec2::<TokenId>()?;
        let flat: Vec<TokenId> = rows.iter().map(|row| row[0]).collect();
        let num_rows = flat.len();
        let embeds: Vec<f32> = flat
            .iter()
            .flat_map(|&t| std::iter::repeat(t as f32).take(HIDDEN_SIZE))
            .collect();
        Ok(Tensor::from_vec(
            embeds,
            (num_rows, 1, HIDDEN_SIZE),
            &Device::Cpu,
        )?)
    }
}

/// Beam-search-shaped test policy: at the prompt-step sample it forks a
/// group's root hypothesis into `num_beams`, each taking a distinct token;
/// afterwards every hypothesis follows its own argmax chain until
/// `max_new_tokens`. The fork step maps every beam onto the group's single
/// previous row; later steps are the identity mapping.
#[derive(Default)]
struct ForkingBeamSampler {
    steps: HashMap<RequestId, usize>,
    seed: u64,
}

fn row_argmax(logits: &Tensor, row: usize) -> Result<TokenId, SamplerError> {
    use candle_core::IndexOp;
    let row = logits.i(row)?;
    let (positions, _) = row.dims2()?;
    let scores = row.i(positions - 1)?.to_vec1::<f32>()?;
    let mut best = 0;
    for (idx, &score) in scores.iter().enumerate() {
        if score > scores[best] {
            best = idx;
        }
    }
    Ok(best as TokenId)
}

impl Sampler for ForkingBeamSampler {
    fn sample(
        &mut self,
        groups: &[SyncSequenceGroup],
        logits: &Tensor,
    ) -> Result<(), SamplerError> {
        let mut logits_idx = 0;
        for group in groups {
            let mut group_guard = group.write_lock()?;
            let params = group_guard.sampling_params().clone();
            let step = self.steps.entry(group_guard.request_id).or_insert(0);
            *step += 1;
            let is_fork_step = *step == 1 && params.num_beams > 1;

            if is_fork_step {
                let base = row_argmax(logits, logits_idx)?;
                logits_idx += 1;
                let root_id = group_guard
                    .get_running_sequences()
                    .first()
                    .ok_or_else(|| SamplerError::SequenceError(
                        crate::sequence::SequenceError::MissingSequence(0),
                    ))?
                    .read_lock()?
                    .sequence_id();
                for _ in 1..params.num_beams {
                    group_guard.fork_sequence(root_id)?;
                }
                for (beam, sequence) in
                    group_guard.get_running_sequences().iter().enumerate()
                {
                    let mut sequence_guard = sequence.write_lock()?;
                    sequence_guard
                        .add_token_id(base + beam as TokenId, -0.1 * (beam as f32 + 1.0));
                    if sequence_guard.get_output_len() >= params.max_new_tokens {
                        sequence_guard.set_finish_reason(FinishReason::Length);
                    }
                }
            } else {
                for sequence in group_guard.get_running_sequences() {
                    let token = row_argmax(logits, logits_idx)?;
                    logits_idx += 1;
                    let mut sequence_guard = sequence.write_lock()?;
                    sequence_guard.add_token_id(token, -0.1);
                    if sequence_guard.get_output_len() >= params.max_new_tokens {
                        sequence_guard.set_finish_reason(FinishReason::Length);
                    }
                }
            }
        }
        Ok(())
    }

    fn get_beam_idxs(&mut self, group: &SequenceGroup) -> HashMap<SequenceId, u32> {
        let step = self.steps.get(&group.request_id).copied().unwrap_or(0);
        let fork_just_happened = step == 1 && group.sampling_params().num_beams > 1;
        group
            .get_running_sequences()
            .iter()
            .enumerate()
            .filter_map(|(row, sequence)| {
                sequence.read().ok().map(|s| {
                    let source = if fork_just_happened { 0 } else { row as u32 };
                    (s.sequence_id(), source)
                })
            })
            .collect()
    }

    fn clear_request_info(&mut self, request_id: RequestId) {
        self.steps.remove(&request_id);
    }

    fn set_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn get_seed(&self) -> u64 {
        self.seed
    }
}

fn sync_group(
    request_id: RequestId,
    prompt: Vec<TokenId>,
    config: GenerationConfig,
) -> SyncSequenceGroup {
    Arc::new(RwLock::new(
        SequenceGroup::new(request_id, prompt, config).unwrap(),
    ))
}

fn token_id_inputs(prompt: &[TokenId]) -> DecodingInputs {
    let len = prompt.len();
    DecodingInputs {
        inputs: Tensor::from_vec(prompt.to_vec(), (1, len), &Device::Cpu).unwrap(),
        attention_mask: Tensor::from_vec(vec![1i64; len], (1, len), &Device::Cpu).unwrap(),
        position_ids: Some(
            Tensor::from_vec((0..len as i64).collect::<Vec<_>>(), (1, len), &Device::Cpu)
                .unwrap(),
        ),
    }
}

fn greedy_config(max_new_tokens: usize, eos: TokenId) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        eos_token_id: Some(eos),
        ..Default::default()
    }
}

#[test]
fn greedy_decode_follows_successor_chain() {
    init_tracing();
    let (mut engine, _) = MockEngine::new();
    let mut sampler = GreedySampler::new();
    let group = sync_group(0, vec![1, 2, 3], greedy_config(5, 31));

    let (results, disappeared) = get_encoded_results(
        &mut engine,
        token_id_inputs(&[1, 2, 3]),
        &mut sampler,
        vec![group],
        None,
    )
    .unwrap();

    // The mock model always predicts token + 1.
    assert_eq!(results.tokens, vec![vec![4, 5, 6, 7, 8]]);
    assert_eq!(results.scores.len(), 1);
    // Length-capped: the last token never reached the engine.
    assert_eq!(disappeared, Some(8));
}

#[test]
fn greedy_decode_stops_on_eos_without_disappeared_token() {
    init_tracing();
    let (mut engine, _) = MockEngine::new();
    let mut sampler = GreedySampler::new();
    let group = sync_group(0, vec![1, 2, 3], greedy_config(10, 6));

    let (results, disappeared) = get_encoded_results(
        &mut engine,
        token_id_inputs(&[1, 2, 3]),
        &mut sampler,
        vec![group],
        None,
    )
    .unwrap();

    assert_eq!(results.tokens, vec![vec![4, 5, 6]]);
    assert_eq!(disappeared, None);
}

#[test]
fn prompt_shorter_than_prompt_step_is_rejected() {
    init_tracing();
    let (mut engine, _) = MockEngine::new();
    let mut sampler = GreedySampler::new();
    // Three tokens fed, but the group claims a two-token prompt.
    let group = sync_group(0, vec![1, 2], greedy_config(4, 31));

    let result = get_encoded_results(
        &mut engine,
        token_id_inputs(&[1, 2, 3]),
        &mut sampler,
        vec![group],
        None,
    );
    assert!(matches!(
        result,
        Err(DecodingError::PromptShorterThanStep { .. })
    ));
}

#[test]
fn dropped_handle_retires_group_with_partial_output() {
    init_tracing();
    let (mut engine, _) = MockEngine::new();
    let mut sampler = GreedySampler::new();
    let group = sync_group(0, vec![1, 2, 3], greedy_config(10, 31));
    group.read().unwrap().generation_handle().abort();

    let (results, disappeared) = get_encoded_results(
        &mut engine,
        token_id_inputs(&[1, 2, 3]),
        &mut sampler,
        vec![group],
        None,
    )
    .unwrap();

    // Only the prompt-step token was produced before the group was retired;
    // it was sampled but never committed, so it must surface as disappeared.
    assert_eq!(results.tokens, vec![vec![4]]);
    assert_eq!(disappeared, Some(4));
}

#[test]
fn empty_group_list_is_rejected() {
    let (mut engine, _) = MockEngine::new();
    let mut sampler = GreedySampler::new();
    let result = get_encoded_results(
        &mut engine,
        token_id_inputs(&[1]),
        &mut sampler,
        vec![],
        None,
    );
    assert!(matches!(result, Err(DecodingError::NoSequenceGroups)));
}

#[test]
fn beam_offsets_recomputed_when_groups_retire() {
    init_tracing();
    let (mut engine, recorder) = MockEngine::new();
    let mut sampler = ForkingBeamSampler::default();

    let group_a = sync_group(0, vec![1, 2], greedy_config(2, 31));
    let group_b = sync_group(
        1,
        vec![5, 6],
        GenerationConfig {
            max_new_tokens: 4,
            num_beams: 3,
            num_return_sequences: 2,
            eos_token_id: Some(31),
            ..Default::default()
        },
    );

    let inputs = DecodingInputs {
        inputs: Tensor::from_vec(vec![1u32, 2, 5, 6], (2, 2), &Device::Cpu).unwrap(),
        attention_mask: Tensor::from_vec(vec![1i64; 4], (2, 2), &Device::Cpu).unwrap(),
        position_ids: Some(
            Tensor::from_vec(vec![0i64, 1, 0, 1], (2, 2), &Device::Cpu).unwrap(),
        ),
    };
    let (results, _) = get_encoded_results(
        &mut engine,
        inputs,
        &mut sampler,
        vec![group_a, group_b],
        None,
    )
    .unwrap();

    // Group order defines result order: A's single hypothesis, then B's two
    // best beams (fork logprobs rank beam 0 first).
    assert_eq!(
        results.tokens,
        vec![vec![3, 4], vec![7, 8, 9, 10], vec![8, 9, 10, 11]]
    );

    // Per-step beam mappings observed by the engine. After A retires at step
    // two, B's offset collapses from 1 to 0 because the offset table is a
    // fresh prefix sum over the groups still active, not a stale carry-over.
    let beam_history = recorder.lock().unwrap().beam_idx_history.clone();
    assert_eq!(
        beam_history,
        vec![
            vec![0, 0],       // prompt step, one row per group
            vec![0, 1, 1, 1], // B's three beams all fork from its old row 1
            vec![1, 2, 3],    // A retired; B's rows still offset by A's old row
            vec![0, 1, 2],    // offsets recomputed over B alone
        ]
    );
}

#[test]
fn pipeline_generates_from_prompt_and_images() {
    init_tracing();
    let (engine, recorder) = MockEngine::new();
    let mut pipeline = VlmPipeline::new(
        engine,
        MockEmbedder::default(),
        GreedySampler::new(),
        Device::Cpu,
        greedy_config(3, 31),
    )
    .unwrap();

    let image = Tensor::zeros((1, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
    let results = pipeline.generate("1 2", &[image], None).unwrap();

    // Input becomes [IMAGE_TOKEN, 1, 2]; the chain continues from 2.
    assert_eq!(results.tokens, vec![vec![3, 4, 5]]);
    // Non-chat turns tear the conversation down afterwards.
    assert_eq!(recorder.lock().unwrap().num_resets, 1);
}

#[test]
fn chat_turns_reuse_cache_and_refeed_disappeared_token() {
    init_tracing();
    let (engine, recorder) = MockEngine::new();
    let mut pipeline = VlmPipeline::new(
        engine,
        MockEmbedder::default(),
        GreedySampler::new(),
        Device::Cpu,
        greedy_config(2, 31),
    )
    .unwrap();

    pipeline.start_chat().unwrap();

    // Turn one is length-capped at two tokens: [4, 5], with 5 sampled but
    // never fed back into the engine.
    let first = pipeline.generate("1 2 3", &[], None).unwrap();
    assert_eq!(first.tokens, vec![vec![4, 5]]);

    // Turn two must re-feed the disappeared token ahead of the new prompt:
    // input [5, 10], so the chain continues from 10.
    let second = pipeline.generate("10", &[], None).unwrap();
    assert_eq!(second.tokens, vec![vec![11, 12]]);

    let recorder = recorder.lock().unwrap();
    // Greedy turns schedule no eviction; both trims are no-ops, and zero-trim
    // idempotence means the engine cache carried straight across the turns.
    assert_eq!(recorder.trim_calls, vec![0, 0]);
    assert_eq!(recorder.num_resets, 1); // only the start_chat reset

    drop(recorder);
    pipeline.finish_chat().unwrap();
}

#[test]
fn chat_beam_turn_evicts_committed_answer_before_next_turn() {
    init_tracing();
    let (engine, recorder) = MockEngine::new();
    let mut pipeline = VlmPipeline::new(
        engine,
        MockEmbedder::default(),
        ForkingBeamSampler::default(),
        Device::Cpu,
        GenerationConfig {
            max_new_tokens: 3,
            num_beams: 2,
            eos_token_id: Some(31),
            ..Default::default()
        },
    )
    .unwrap();

    pipeline.start_chat().unwrap();

    // Beams [3, 4, 5] and [4, 5, 6]; two generation steps commit two rows.
    let first = pipeline.generate("1 2", &[], None).unwrap();
    assert_eq!(first.tokens[0], vec![3, 4, 5]);

    // The committed rows belong to whichever beam the engine last advanced,
    // so the whole answer is evicted and re-fed on the next turn.
    let second = pipeline.generate("20", &[], None).unwrap();
    assert_eq!(second.tokens[0].len(), 3);

    let recorder = recorder.lock().unwrap();
    assert_eq!(recorder.trim_calls, vec![0, 2]);
}

#[test]
fn per_call_config_overrides_default_and_fills_eos() {
    init_tracing();
    let (engine, _) = MockEngine::new();
    let mut pipeline = VlmPipeline::new(
        engine,
        MockEmbedder::default(),
        GreedySampler::new(),
        Device::Cpu,
        greedy_config(8, 6),
    )
    .unwrap();

    // Override caps generation at one token; eos comes from the default.
    let results = pipeline
        .generate(
            "1 2 3",
            &[],
            Some(GenerationConfig {
                max_new_tokens: 1,
                eos_token_id: None,
                ..Default::default()
            }),
        )
        .unwrap();
    assert_eq!(results.tokens, vec![vec![4]]);
}

#[test]
fn invalid_config_is_rejected_before_any_engine_call() {
    let (engine, recorder) = MockEngine::new();
    let mut pipeline = VlmPipeline::new(
        engine,
        MockEmbedder::default(),
        GreedySampler::new(),
        Device::Cpu,
        greedy_config(4, 31),
    )
    .unwrap();

    let result = pipeline.generate(
        "1",
        &[],
        Some(GenerationConfig {
            max_new_tokens: 0,
            eos_token_id: Some(31),
            ..Default::default()
        }),
    );
    assert!(result.is_err());
    // No trim, no reset beyond construction: the engine was never touched.
    let recorder = recorder.lock().unwrap();
    assert!(recorder.trim_calls.is_empty());
    assert_eq!(recorder.num_resets, 0);
}
