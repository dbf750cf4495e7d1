//! The declarative action engine (§4.4).
//!
//! An action genus declares named resource preconditions, named typed
//! parameters, and a handler: an ordered list of effects with token
//! placeholders (`$res.X.id`, `$param.X`, `$now`). Taking an action
//! resolves every token and validates every precondition *before*
//! executing a single effect, so a rejected action never leaves partial
//! writes behind even though the underlying store has no rollback.
use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{info, instrument};

use crate::entity::{self};
use crate::error::{KernelError, KernelResult};
use crate::genus::types::AttributeType;
use crate::genus::{load_genus, GenusDef};
use crate::ids::{sentinel_ids, Ulid};
use crate::relationship;
use crate::session::Session;

/// A named resource precondition an action declares against its caller-supplied bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    pub name: String,
    pub genus_id: Ulid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_status: Option<String>,
}

/// A named, typed parameter an action accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    pub parameter_type: AttributeType,
    pub required: bool,
}

/// One declarative side effect in an action's handler, written with
/// unresolved token placeholders in its JSON fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActionEffect {
    SetAttribute {
        resource: String,
        key: String,
        value: JsonValue,
    },
    TransitionStatus {
        resource: String,
        to: String,
    },
    AddMember {
        resource: String,
        role: String,
        member: JsonValue,
    },
    CreateEntity {
        genus_id: Ulid,
        attributes: Map<String, JsonValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bind_as: Option<String>,
    },
    CreateLog {
        message: JsonValue,
    },
    CreateError {
        #[serde(skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
        message: JsonValue,
    },
    CreateTask {
        title: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<JsonValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        associated_res_id: Option<String>,
    },
}

fn action_meta<T: for<'de> Deserialize<'de>>(genus: &GenusDef, key: &str) -> KernelResult<Vec<T>> {
    match genus.meta.entries.get(key) {
        None => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(KernelError::SerializationError),
    }
}

/// Resolve a single string token (`$res.X.id`, `$param.X`, `$now`) to a
/// concrete JSON value. Non-token strings pass through unchanged.
fn resolve_token(
    raw: &str,
    resources: &HashMap<String, Ulid>,
    params: &HashMap<String, JsonValue>,
    now: chrono::DateTime<Utc>,
) -> KernelResult<JsonValue> {
    if raw == "$now" {
        return Ok(JsonValue::String(now.to_rfc3339()));
    }
    if let Some(rest) = raw.strip_prefix("$res.") {
        let (name, field) = rest.split_once('.').ok_or_else(|| KernelError::TokenResolution {
            token: raw.to_string(),
        })?;
        let id = resources.get(name).ok_or_else(|| KernelError::TokenResolution {
            token: raw.to_string(),
        })?;
        return match field {
            "id" => Ok(JsonValue::String(id.to_string())),
            _ => Err(KernelError::TokenResolution { token: raw.to_string() }),
        };
    }
    if let Some(name) = raw.strip_prefix("$param.") {
        return params
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::TokenResolution { token: raw.to_string() });
    }
    Ok(JsonValue::String(raw.to_string()))
}

/// Recursively resolve tokens appearing as whole string values anywhere in
/// a JSON value (objects, arrays, and bare strings).
fn resolve_value(
    value: &JsonValue,
    resources: &HashMap<String, Ulid>,
    params: &HashMap<String, JsonValue>,
    now: chrono::DateTime<Utc>,
) -> KernelResult<JsonValue> {
    match value {
        JsonValue::String(s) if s.starts_with('$') => resolve_token(s, resources, params, now),
        JsonValue::Array(items) => Ok(JsonValue::Array(
            items
                .iter()
                .map(|v| resolve_value(v, resources, params, now))
                .collect::<KernelResult<Vec<_>>>()?,
        )),
        JsonValue::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, resources, params, now)?);
            }
            Ok(JsonValue::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// A fully resolved effect, ready to execute with no further token lookups.
enum ResolvedEffect {
    SetAttribute { resource_id: Ulid, key: String, value: JsonValue },
    TransitionStatus { resource_id: Ulid, to: String },
    AddMember { resource_id: Ulid, role: String, member: Ulid },
    CreateEntity { genus_id: Ulid, attributes: Map<String, JsonValue>, bind_as: Option<String> },
    CreateLog { message: JsonValue },
    CreateError { source_entity_id: Option<Ulid>, message: JsonValue },
    CreateTask { title: JsonValue, description: Option<JsonValue>, associated_res_id: Option<Ulid> },
}

/// Take an action: validate preconditions, resolve every handler effect,
/// then execute them in order. Resources created by earlier effects
/// (`bind_as`) are available to later effects in the same handler.
#[instrument(skip(store, resources, params))]
pub fn take_action(
    store: &crate::tessella::TessellaStore,
    session: &Session,
    action_genus_id: Ulid,
    mut resources: HashMap<String, Ulid>,
    params: HashMap<String, JsonValue>,
) -> KernelResult<()> {
    let genus = load_genus(store, &action_genus_id)?;
    let resource_defs: Vec<ResourceDef> = action_meta(&genus, "resources")?;
    let parameter_defs: Vec<ParameterDef> = action_meta(&genus, "parameters")?;
    let handler: Vec<ActionEffect> = action_meta(&genus, "handler")?;

    for def in &resource_defs {
        let id = resources.get(&def.name).ok_or_else(|| KernelError::PreconditionFailed {
            resource: def.name.clone(),
            reason: "no binding supplied".to_string(),
        })?;
        let res = store.get_res(id)?;
        if res.genus_id != def.genus_id {
            return Err(KernelError::PreconditionFailed {
                resource: def.name.clone(),
                reason: format!("expected genus '{}', got '{}'", def.genus_id, res.genus_id),
            });
        }
        if let Some(required) = &def.required_status {
            let state = entity::materialize(store, &res.branch_id, *id)?;
            if state.status.as_deref() != Some(required.as_str()) {
                return Err(KernelError::PreconditionFailed {
                    resource: def.name.clone(),
                    reason: format!(
                        "expected status '{required}', got '{}'",
                        state.status.unwrap_or_default()
                    ),
                });
            }
        }
    }

    for def in &parameter_defs {
        match params.get(&def.name) {
            Some(value) => {
                if !def.parameter_type.accepts(value) {
                    return Err(KernelError::BadParameter {
                        parameter: def.name.clone(),
                        reason: format!("expected {:?}, got {value}", def.parameter_type),
                    });
                }
            }
            None if def.required => {
                return Err(KernelError::BadParameter {
                    parameter: def.name.clone(),
                    reason: "required parameter missing".to_string(),
                });
            }
            None => {}
        }
    }

    let now = Utc::now();
    let mut resolved = Vec::with_capacity(handler.len());
    for effect in &handler {
        resolved.push(match effect {
            ActionEffect::SetAttribute { resource, key, value } => ResolvedEffect::SetAttribute {
                resource_id: *resources.get(resource).ok_or_else(|| KernelError::TokenResolution {
                    token: format!("$res.{resource}"),
                })?,
                key: key.clone(),
                value: resolve_value(value, &resources, &params, now)?,
            },
            ActionEffect::TransitionStatus { resource, to } => ResolvedEffect::TransitionStatus {
                resource_id: *resources.get(resource).ok_or_else(|| KernelError::TokenResolution {
                    token: format!("$res.{resource}"),
                })?,
                to: to.clone(),
            },
            ActionEffect::AddMember { resource, role, member } => {
                let member_value = resolve_value(member, &resources, &params, now)?;
                let member_id: Ulid = member_value
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| KernelError::TokenResolution {
                        token: member.to_string(),
                    })?;
                ResolvedEffect::AddMember {
                    resource_id: *resources.get(resource).ok_or_else(|| KernelError::TokenResolution {
                        token: format!("$res.{resource}"),
                    })?,
                    role: role.clone(),
                    member: member_id,
                }
            }
            ActionEffect::CreateEntity { genus_id, attributes, bind_as } => {
                let mut resolved_attrs = Map::new();
                for (k, v) in attributes {
                    resolved_attrs.insert(k.clone(), resolve_value(v, &resources, &params, now)?);
                }
                ResolvedEffect::CreateEntity {
                    genus_id: *genus_id,
                    attributes: resolved_attrs,
                    bind_as: bind_as.clone(),
                }
            }
            ActionEffect::CreateLog { message } => ResolvedEffect::CreateLog {
                message: resolve_value(message, &resources, &params, now)?,
            },
            ActionEffect::CreateError { resource, message } => ResolvedEffect::CreateError {
                source_entity_id: match resource {
                    Some(resource) => Some(*resources.get(resource).ok_or_else(|| KernelError::TokenResolution {
                        token: format!("$res.{resource}"),
                    })?),
                    None => None,
                },
                message: resolve_value(message, &resources, &params, now)?,
            },
            ActionEffect::CreateTask { title, description, associated_res_id } => ResolvedEffect::CreateTask {
                title: resolve_value(title, &resources, &params, now)?,
                description: description
                    .as_ref()
                    .map(|d| resolve_value(d, &resources, &params, now))
                    .transpose()?,
                associated_res_id: match associated_res_id {
                    Some(resource) => Some(*resources.get(resource).ok_or_else(|| KernelError::TokenResolution {
                        token: format!("$res.{resource}"),
                    })?),
                    None => None,
                },
            },
        });

        // bind_as from a CreateEntity must be resolvable by later effects
        // in this same handler, so execute CreateEntity as soon as it's
        // resolved rather than deferring every effect to a second pass.
        if let Some(ResolvedEffect::CreateEntity { genus_id, attributes, bind_as }) = resolved.last() {
            let new_id = entity::create_entity(store, session, *genus_id, attributes.clone(), None)?;
            if let Some(name) = bind_as {
                resources.insert(name.clone(), new_id);
            }
            resolved.pop();
            resolved.push(ResolvedEffect::CreateLog {
                message: JsonValue::String(format!("created {new_id}")),
            });
            continue;
        }
    }

    for effect in resolved {
        match effect {
            ResolvedEffect::SetAttribute { resource_id, key, value } => {
                entity::set_attribute(store, session, resource_id, &key, value)?;
            }
            ResolvedEffect::TransitionStatus { resource_id, to } => {
                entity::transition_status(store, session, resource_id, &to)?;
            }
            ResolvedEffect::AddMember { resource_id, role, member } => {
                relationship::add_member(store, session, resource_id, &role, member)?;
            }
            ResolvedEffect::CreateEntity { .. } => {
                // already executed above, during resolution
            }
            ResolvedEffect::CreateLog { message } => {
                let mut attrs = Map::new();
                attrs.insert("message".to_string(), message);
                entity::create_entity(store, session, sentinel_ids::LOG_GENUS, attrs, None)?;
            }
            ResolvedEffect::CreateError { source_entity_id, message } => {
                let mut attrs = Map::new();
                attrs.insert("reason".to_string(), message);
                if let Some(id) = source_entity_id {
                    attrs.insert("source_entity_id".to_string(), JsonValue::String(id.to_string()));
                }
                entity::create_entity(store, session, sentinel_ids::ERROR_GENUS, attrs, None)?;
            }
            ResolvedEffect::CreateTask { title, description, associated_res_id } => {
                let mut attrs = Map::new();
                attrs.insert("title".to_string(), title);
                if let Some(description) = description {
                    attrs.insert("description".to_string(), description);
                }
                if let Some(id) = associated_res_id {
                    attrs.insert("associated_res_id".to_string(), JsonValue::String(id.to_string()));
                }
                entity::create_entity(store, session, sentinel_ids::TASK_GENUS, attrs, None)?;
            }
        }
    }

    info!(action_genus = %action_genus_id, "action taken");
    let mut audit = Map::new();
    audit.insert("action_genus_id".to_string(), JsonValue::String(action_genus_id.to_string()));
    let bindings_json = serde_json::to_string(
        &resources
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.to_string())))
            .collect::<Map<String, JsonValue>>(),
    )
    .map_err(KernelError::SerializationError)?;
    audit.insert("bindings_json".to_string(), JsonValue::String(bindings_json));
    let params_json = serde_json::to_string(&params).map_err(KernelError::SerializationError)?;
    audit.insert("params_json".to_string(), JsonValue::String(params_json));
    entity::create_entity(store, session, sentinel_ids::ACTION_TAKEN_GENUS, audit, None)?;
    Ok(())
}
