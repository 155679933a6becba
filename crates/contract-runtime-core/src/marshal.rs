//! Marshalling between host [`Value`]s and native call words.
//!
//! Every argument becomes one or two 64-bit words:
//! - Integers, floats and booleans are a pure bit reinterpretation. `I32` is
//!   sign-extended, `U32` zero-extended, floats keep their IEEE-754 bits and
//!   booleans map to `0`/`1`.
//! - Strings and byte buffers become a `(ptr, len)` pair. Encoding writes a
//!   zero placeholder for `ptr` and records a [`MemorySegment`] in the
//!   [`MemoryMappingPlan`]; the bytes are written and the placeholder
//!   backpatched once a live instance exists.
//!
//! Decoding is strict: the number of words must match the declared result
//! types exactly.

use contract_runtime_common::{MarshalConfig, RuntimeError, Value, ValueType};

use crate::instance::ContractInstance;

/// A string or buffer argument awaiting placement in linear memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySegment {
    /// `argN`, after the argument position.
    pub name: String,
    /// Index of the pointer word to backpatch.
    pub word_index: usize,
    pub size: usize,
    /// Address assigned once written.
    pub address: Option<u32>,
    bytes: Vec<u8>,
}

impl MemorySegment {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_bound(&self) -> bool {
        self.address.is_some()
    }
}

/// Segments to place in linear memory before a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryMappingPlan {
    pub segments: Vec<MemorySegment>,
}

impl MemoryMappingPlan {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total bytes the plan needs.
    pub fn total_size(&self) -> usize {
        self.segments.iter().map(|s| s.size).sum()
    }

    pub fn is_bound(&self) -> bool {
        self.segments.iter().all(MemorySegment::is_bound)
    }

    pub(crate) fn segments_mut(&mut self) -> &mut [MemorySegment] {
        &mut self.segments
    }
}

/// Arguments after phase one of encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedArgs {
    pub words: Vec<u64>,
    /// One tag per argument value.
    pub types: Vec<ValueType>,
    pub plan: MemoryMappingPlan,
}

/// Converts values to and from native words under the configured ceilings.
#[derive(Debug, Clone, Default)]
pub struct Marshaller {
    config: MarshalConfig,
}

impl Marshaller {
    pub fn new(config: MarshalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MarshalConfig {
        &self.config
    }

    /// Phase one: encode `args` into words and a memory plan.
    pub fn encode_args(&self, args: &[Value]) -> Result<EncodedArgs, RuntimeError> {
        if args.len() > self.config.max_params {
            return Err(RuntimeError::validation(
                "TOO_MANY_PARAMS",
                "Too many arguments",
            )
            .with_details(format!(
                "{} arguments, limit is {}",
                args.len(),
                self.config.max_params
            )));
        }

        let mut encoded = EncodedArgs {
            words: Vec::with_capacity(args.len()),
            types: Vec::with_capacity(args.len()),
            plan: MemoryMappingPlan::default(),
        };

        for (index, value) in args.iter().enumerate() {
            encoded.types.push(value.value_type());

            if let Some(word) = encode_scalar(value) {
                encoded.words.push(word);
                continue;
            }

            let bytes = value.as_bytes().unwrap_or_default();
            if bytes.len() > self.config.max_param_size {
                return Err(RuntimeError::validation(
                    "PARAM_TOO_LARGE",
                    "Argument exceeds the size limit",
                )
                .with_details(format!(
                    "arg{index} is {} bytes, limit is {}",
                    bytes.len(),
                    self.config.max_param_size
                )));
            }

            encoded.plan.segments.push(MemorySegment {
                name: format!("arg{index}"),
                word_index: encoded.words.len(),
                size: bytes.len(),
                address: None,
                bytes: bytes.to_vec(),
            });
            encoded.words.push(0);
            encoded.words.push(bytes.len() as u64);
        }

        Ok(encoded)
    }

    /// Decode scalar results.
    ///
    /// # Errors
    ///
    /// Fails when the word count does not match `types`, when there are more
    /// results than allowed, or when a type needs linear memory (use
    /// [`Marshaller::decode_results_from`] for strings and buffers).
    pub fn decode_results(
        &self,
        words: &[u64],
        types: &[ValueType],
    ) -> Result<Vec<Value>, RuntimeError> {
        self.check_result_shape(words, types)?;

        types
            .iter()
            .zip(words)
            .map(|(ty, word)| {
                decode_scalar(*word, *ty).ok_or_else(|| {
                    RuntimeError::validation(
                        "RESULT_NEEDS_MEMORY",
                        "Result type must be read from linear memory",
                    )
                    .with_details(ty.to_string())
                })
            })
            .collect()
    }

    /// Decode results, reading string and buffer results from `instance`.
    pub fn decode_results_from(
        &self,
        words: &[u64],
        types: &[ValueType],
        instance: &ContractInstance,
    ) -> Result<Vec<Value>, RuntimeError> {
        self.check_result_shape(words, types)?;

        let mut values = Vec::with_capacity(types.len());
        let mut cursor = 0;
        for ty in types {
            if let Some(value) = decode_scalar(words[cursor], *ty) {
                values.push(value);
                cursor += 1;
                continue;
            }

            let (ptr, len) = (words[cursor], words[cursor + 1]);
            cursor += 2;
            if len > self.config.max_param_size as u64 {
                return Err(RuntimeError::validation(
                    "RESULT_TOO_LARGE",
                    "Result exceeds the size limit",
                )
                .with_details(format!("{len} bytes")));
            }

            let bytes = instance.read_bytes(ptr, len)?;
            values.push(match ty {
                ValueType::String => Value::String(String::from_utf8(bytes).map_err(|e| {
                    RuntimeError::validation("INVALID_UTF8", "String result is not UTF-8")
                        .with_source(e)
                })?),
                _ => Value::Bytes(bytes),
            });
        }

        Ok(values)
    }

    fn check_result_shape(&self, words: &[u64], types: &[ValueType]) -> Result<(), RuntimeError> {
        if types.len() > self.config.max_results {
            return Err(RuntimeError::validation(
                "TOO_MANY_RESULTS",
                "Too many result values",
            )
            .with_details(format!(
                "{} results, limit is {}",
                types.len(),
                self.config.max_results
            )));
        }

        let expected: usize = types.iter().map(|t| t.word_count()).sum();
        if expected != words.len() {
            return Err(RuntimeError::validation(
                "RESULT_COUNT_MISMATCH",
                "Result count does not match declared return types",
            )
            .with_details(format!(
                "got {} words, declared types need {expected}",
                words.len()
            )));
        }
        Ok(())
    }
}

/// Encode a scalar value. Returns `None` for strings and buffers.
#[allow(clippy::cast_sign_loss)]
pub fn encode_scalar(value: &Value) -> Option<u64> {
    Some(match value {
        Value::I32(v) => i64::from(*v) as u64,
        Value::U32(v) => u64::from(*v),
        Value::I64(v) => *v as u64,
        Value::U64(v) => *v,
        Value::F32(v) => u64::from(v.to_bits()),
        Value::F64(v) => v.to_bits(),
        Value::Bool(v) => u64::from(*v),
        Value::String(_) | Value::Bytes(_) => return None,
    })
}

/// Decode one word as a scalar. Returns `None` for strings and buffers.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn decode_scalar(word: u64, ty: ValueType) -> Option<Value> {
    Some(match ty {
        ValueType::I32 => Value::I32(word as u32 as i32),
        ValueType::U32 => Value::U32(word as u32),
        ValueType::I64 => Value::I64(word as i64),
        ValueType::U64 => Value::U64(word),
        ValueType::F32 => Value::F32(f32::from_bits(word as u32)),
        ValueType::F64 => Value::F64(f64::from_bits(word)),
        ValueType::Bool => Value::Bool(word as u32 != 0),
        ValueType::String | ValueType::Bytes => return None,
    })
}
