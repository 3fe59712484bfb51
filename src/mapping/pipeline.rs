//! Per-connection mapping pipeline.
//!
//! Instantiates the connection's configured mappers once and applies them
//! to inbound messages and outbound signals. On the outbound path, targets
//! requesting the exact same ordered mapper chain share a single mapper
//! invocation per chain element, so the work is per distinct chain rather
//! than per target.

use crate::connections::model::{Connection, MapperDefinition, Target};
use crate::mapping::mapper::{ContentTypeGate, MessageMapper, ProtocolJsonMapper};
use crate::mapping::registry::MapperRegistry;
use crate::mapping::{MappingOutcome, OutboundSignal};
use crate::protocol::error::GatewayError;
use crate::protocol::message::ExternalMessage;
use crate::protocol::signal::Signal;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Mapper id used when a source, target, or message names none.
pub const DEFAULT_MAPPER: &str = ProtocolJsonMapper::ALIAS;

/// A mapped external message together with the targets of its group.
#[derive(Debug, Clone)]
pub struct MappedOutboundMessage {
    pub message: ExternalMessage,
    pub targets: Vec<Target>,
}

struct PipelineMapper {
    gate: ContentTypeGate,
    mapper: Box<dyn MessageMapper>,
}

/// Stateless (after construction) mapping pipeline; safe to call from any
/// task without synchronization.
pub struct MappingPipeline {
    mappers: HashMap<String, PipelineMapper>,
}

impl MappingPipeline {
    /// Instantiate every mapper the connection references. Unknown engines
    /// or ids fail here, which is what makes malformed payload-mappings a
    /// create/modify-time validation error.
    pub fn for_connection(
        connection: &Connection,
        registry: &MapperRegistry,
    ) -> Result<Self, GatewayError> {
        let mut mappers = HashMap::new();
        for (id, definition) in &connection.mapping_definitions {
            mappers.insert(
                id.clone(),
                PipelineMapper {
                    gate: ContentTypeGate::new(
                        definition.content_type_allowlist.clone(),
                        definition.content_type_blocklist.clone(),
                    ),
                    mapper: registry.instantiate(definition)?,
                },
            );
        }

        // Mapper ids referenced directly by bindings resolve to registered
        // aliases with default options.
        let mut referenced: HashSet<&String> = HashSet::new();
        for source in &connection.sources {
            referenced.extend(source.payload_mapping.iter());
        }
        for target in &connection.targets {
            referenced.extend(target.payload_mapping.iter());
        }
        for id in referenced {
            if !mappers.contains_key(id) {
                mappers.insert(
                    id.clone(),
                    PipelineMapper {
                        gate: ContentTypeGate::default(),
                        mapper: registry.instantiate(&MapperDefinition::new(id))?,
                    },
                );
            }
        }

        if !mappers.contains_key(DEFAULT_MAPPER) {
            mappers.insert(
                DEFAULT_MAPPER.to_string(),
                PipelineMapper {
                    gate: ContentTypeGate::default(),
                    mapper: registry.instantiate(&MapperDefinition::new(DEFAULT_MAPPER))?,
                },
            );
        }

        Ok(Self { mappers })
    }

    fn effective_chain(ids: &[String]) -> Vec<String> {
        if ids.is_empty() {
            vec![DEFAULT_MAPPER.to_string()]
        } else {
            ids.to_vec()
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Map an external message to internal signals, one outcome per mapper
    /// result element.
    pub fn process_inbound(&self, message: &ExternalMessage) -> Vec<MappingOutcome<Signal>> {
        let chain = Self::effective_chain(message.payload_mapping());

        // Empty notifications carry no signal; drop before any mapper runs.
        if message.is_empty_notification() {
            return vec![MappingOutcome::Dropped {
                mapper: chain[0].clone(),
            }];
        }

        let mut outcomes = Vec::new();
        for id in chain {
            let Some(entry) = self.mappers.get(&id) else {
                outcomes.push(MappingOutcome::Error {
                    mapper: id.clone(),
                    error: GatewayError::mapping_failed(&id, "mapper is not configured"),
                    topic_path: message.topic_path().map(str::to_string),
                });
                continue;
            };
            if !entry.gate.permits(message.content_type()) {
                outcomes.push(MappingOutcome::Dropped { mapper: id });
                continue;
            }
            match entry.mapper.map_inbound(message) {
                Ok(signals) if signals.is_empty() => {
                    outcomes.push(MappingOutcome::Dropped { mapper: id });
                }
                Ok(signals) => {
                    for signal in signals {
                        outcomes.push(MappingOutcome::Mapped {
                            mapper: id.clone(),
                            value: signal,
                        });
                    }
                }
                Err(error) => {
                    outcomes.push(MappingOutcome::Error {
                        mapper: id,
                        error,
                        topic_path: message.topic_path().map(str::to_string),
                    });
                }
            }
        }
        outcomes
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Map an outbound signal for all its targets, grouped so each distinct
    /// ordered mapper chain runs exactly once.
    pub fn process_outbound(
        &self,
        outbound: &OutboundSignal,
    ) -> Vec<MappingOutcome<MappedOutboundMessage>> {
        // First-seen order keeps outcomes deterministic.
        let mut groups: Vec<(Vec<String>, Vec<Target>)> = Vec::new();
        for target in &outbound.targets {
            let chain = Self::effective_chain(&target.payload_mapping);
            match groups.iter_mut().find(|(key, _)| *key == chain) {
                Some((_, targets)) => targets.push(target.clone()),
                None => groups.push((chain, vec![target.clone()])),
            }
        }

        let mut outcomes = Vec::new();
        for (chain, targets) in groups {
            for id in chain {
                let Some(entry) = self.mappers.get(&id) else {
                    outcomes.push(MappingOutcome::Error {
                        mapper: id.clone(),
                        error: GatewayError::mapping_failed(&id, "mapper is not configured"),
                        topic_path: Some(outbound.signal.topic.path()),
                    });
                    continue;
                };
                match entry.mapper.map_outbound(&outbound.signal) {
                    Ok(messages) if messages.is_empty() => {
                        outcomes.push(MappingOutcome::Dropped { mapper: id });
                    }
                    Ok(messages) => {
                        for message in messages {
                            let message = match &outbound.extra {
                                Some(extra) => merge_extra(message, extra),
                                None => message,
                            };
                            outcomes.push(MappingOutcome::Mapped {
                                mapper: id.clone(),
                                value: MappedOutboundMessage {
                                    message,
                                    targets: targets.clone(),
                                },
                            });
                        }
                    }
                    Err(error) => {
                        outcomes.push(MappingOutcome::Error {
                            mapper: id,
                            error,
                            topic_path: Some(outbound.signal.topic.path()),
                        });
                    }
                }
            }
        }
        outcomes
    }
}

/// Merge enrichment fields into a JSON payload envelope. Non-JSON payloads
/// pass through unchanged.
fn merge_extra(message: ExternalMessage, extra: &Value) -> ExternalMessage {
    let Some(text) = message.text_payload() else {
        return message;
    };
    let Ok(Value::Object(mut envelope)) = serde_json::from_str::<Value>(text) else {
        return message;
    };
    envelope.insert("extra".to_string(), extra.clone());
    match serde_json::to_string(&Value::Object(envelope)) {
        Ok(merged) => message.with_text_payload(merged),
        Err(_) => message,
    }
}
