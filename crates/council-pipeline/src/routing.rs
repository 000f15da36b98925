//! Output routing and phase consolidation.
//!
//! A produced value goes to exactly one [`Destination`]. Destinations inside
//! the run state are applied synchronously with [`apply_local`]; stores and
//! threads are written through collaborators with [`deliver_external`].

use serde_json::{json, Map, Value};

use council_template::stringify;
use council_types::{CouncilError, Result, Run};

use crate::collaborators::{Collaborators, ThreadMessage};
use crate::definition::{Consolidation, OutputConfig, OutputTarget, Phase};

/// Separator placed between string outputs by `merge`.
pub const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// Separator placed between strings by append routing.
pub const APPEND_SEPARATOR: &str = "\n\n";

// ---------------------------------------------------------------------------
// Value combination
// ---------------------------------------------------------------------------

/// Append `incoming` to `existing`: strings concatenate, arrays grow, and
/// anything else becomes a two-element array.
pub fn append_value(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Null, incoming) => incoming,
        (existing, Value::Null) => existing,
        (Value::String(a), Value::String(b)) => {
            if a.is_empty() {
                Value::String(b)
            } else {
                Value::String(format!("{a}{APPEND_SEPARATOR}{b}"))
            }
        }
        (Value::Array(mut items), Value::Array(more)) => {
            items.extend(more);
            Value::Array(items)
        }
        (Value::Array(mut items), other) => {
            items.push(other);
            Value::Array(items)
        }
        (existing, Value::Array(more)) => {
            let mut items = vec![existing];
            items.extend(more);
            Value::Array(items)
        }
        (existing, other) => Value::Array(vec![existing, other]),
    }
}

/// Type-aware merge. Nulls are skipped; all strings join with
/// [`MERGE_SEPARATOR`], all arrays flatten, all objects merge shallowly
/// (later keys win), and mixed types are collected into an array.
pub fn merge_values(values: &[Value]) -> Value {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    match present.as_slice() {
        [] => Value::Null,
        [only] => (*only).clone(),
        _ if present.iter().all(|v| v.is_string()) => Value::String(
            present
                .iter()
                .filter_map(|v| v.as_str())
                .collect::<Vec<_>>()
                .join(MERGE_SEPARATOR),
        ),
        _ if present.iter().all(|v| v.is_array()) => Value::Array(
            present
                .iter()
                .filter_map(|v| v.as_array())
                .flat_map(|items| items.iter().cloned())
                .collect(),
        ),
        _ if present.iter().all(|v| v.is_object()) => {
            let mut merged = Map::new();
            for map in present.iter().filter_map(|v| v.as_object()) {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            Value::Object(merged)
        }
        _ => Value::Array(present.into_iter().cloned().collect()),
    }
}

/// Consolidate a phase's candidate outputs (action id, output) in declared order.
///
/// `current` is the phase output accumulated by routing; `last` keeps it when
/// set so appended output survives. `designated` is the designated action's
/// output, if any. `synthesize` falls back to `merge` here; the engine runs the
/// LLM step when a client is configured.
pub fn consolidate(
    policy: Consolidation,
    candidates: &[(String, Value)],
    current: &Value,
    designated: Option<&Value>,
) -> Value {
    let values: Vec<Value> = candidates.iter().map(|(_, v)| v.clone()).collect();
    match policy {
        Consolidation::Last => {
            if !current.is_null() {
                current.clone()
            } else {
                values
                    .iter()
                    .rev()
                    .find(|v| !v.is_null())
                    .cloned()
                    .unwrap_or(Value::Null)
            }
        }
        Consolidation::First => values
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        Consolidation::Merge | Consolidation::Synthesize => merge_values(&values),
        Consolidation::Designated => designated.cloned().unwrap_or(Value::Null),
        Consolidation::UserGavel => {
            let outputs: Map<String, Value> = candidates.iter().cloned().collect();
            json!({
                "outputs": outputs,
                "merged": merge_values(&values),
                "pending": true,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Dot paths
// ---------------------------------------------------------------------------

pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cursor = root;
    for seg in path.split('.').map(str::trim).filter(|s| !s.is_empty()) {
        cursor = match cursor {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cursor)
}

/// Write `value` at a dot path, creating intermediate objects. Non-object
/// intermediates are replaced.
pub fn set_path(root: &mut Map<String, Value>, path: &str, value: Value, append: bool) {
    let segments: Vec<&str> = path
        .split('.')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = root;
    for seg in parents {
        let slot = cursor
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cursor = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    let next = if append {
        let existing = cursor.remove(*last).unwrap_or(Value::Null);
        append_value(existing, value)
    } else {
        value
    };
    cursor.insert(last.to_string(), next);
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    PhaseOutput { append: bool },
    TeamOutput { team_id: String, append: bool },
    Global { path: String, append: bool },
    Store { store_id: String, entry_id: Option<String> },
    NextAction,
    Thread { thread_id: String },
}

impl Destination {
    /// Resolve an action's output config against its phase.
    ///
    /// `phase_thread` is the thread created for the phase, used when a
    /// `thread` target has no explicit key.
    pub fn from_config(
        output: &OutputConfig,
        phase: &Phase,
        phase_thread: Option<&str>,
    ) -> Result<Self> {
        let key = output.target_key.trim();
        Ok(match output.target {
            OutputTarget::PhaseOutput => Destination::PhaseOutput {
                append: output.append,
            },
            OutputTarget::TeamOutput => {
                let team_id = if key.is_empty() {
                    phase.teams.first().cloned().ok_or_else(|| {
                        CouncilError::Configuration(format!(
                            "teamOutput target in phase '{}' needs a targetKey or a phase team",
                            phase.id
                        ))
                    })?
                } else {
                    key.to_string()
                };
                Destination::TeamOutput {
                    team_id,
                    append: output.append,
                }
            }
            OutputTarget::Global => {
                if key.is_empty() {
                    return Err(CouncilError::Configuration(
                        "global output target needs a targetKey".into(),
                    ));
                }
                Destination::Global {
                    path: key.to_string(),
                    append: output.append,
                }
            }
            OutputTarget::Store => {
                if key.is_empty() {
                    return Err(CouncilError::Configuration(
                        "store output target needs a targetKey".into(),
                    ));
                }
                let (store_id, entry_id) = match key.split_once('.') {
                    Some((s, e)) => (s.to_string(), Some(e.to_string())),
                    None => (key.to_string(), None),
                };
                Destination::Store { store_id, entry_id }
            }
            OutputTarget::NextAction => Destination::NextAction,
            OutputTarget::Thread => {
                let thread_id = if key.is_empty() {
                    phase_thread.map(str::to_string).ok_or_else(|| {
                        CouncilError::Configuration(format!(
                            "thread output target in phase '{}' needs a targetKey or an enabled phase thread",
                            phase.id
                        ))
                    })?
                } else {
                    key.to_string()
                };
                Destination::Thread { thread_id }
            }
        })
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, Destination::Store { .. } | Destination::Thread { .. })
    }

    pub fn label(&self) -> String {
        match self {
            Destination::PhaseOutput { .. } => "phaseOutput".into(),
            Destination::TeamOutput { team_id, .. } => format!("teamOutput:{team_id}"),
            Destination::Global { path, .. } => format!("global:{path}"),
            Destination::Store { store_id, .. } => format!("store:{store_id}"),
            Destination::NextAction => "nextAction".into(),
            Destination::Thread { thread_id } => format!("thread:{thread_id}"),
        }
    }
}

/// Apply a local destination to the run state. External destinations are a no-op.
pub fn apply_local(run: &mut Run, phase_id: &str, dest: &Destination, value: Value) -> Result<()> {
    if let Destination::Global { path, append } = dest {
        set_path(&mut run.globals, path, value, *append);
        return Ok(());
    }
    let phase = run
        .phase_mut(phase_id)
        .ok_or_else(|| CouncilError::Other(format!("phase '{phase_id}' has no state")))?;
    match dest {
        Destination::PhaseOutput { append } => {
            phase.output = if *append {
                append_value(std::mem::take(&mut phase.output), value)
            } else {
                value
            };
        }
        Destination::TeamOutput { team_id, append } => {
            let next = if *append {
                let existing = phase.team_outputs.remove(team_id).unwrap_or(Value::Null);
                append_value(existing, value)
            } else {
                value
            };
            phase.team_outputs.insert(team_id.clone(), next);
        }
        Destination::NextAction => phase.next_action_input = Some(value),
        Destination::Global { .. } | Destination::Store { .. } | Destination::Thread { .. } => {}
    }
    Ok(())
}

/// Write a value to an external destination through the collaborators.
pub async fn deliver_external(
    dest: &Destination,
    value: &Value,
    collaborators: &Collaborators,
    author: &str,
) -> Result<()> {
    match dest {
        Destination::Store { store_id, entry_id } => {
            let curation = collaborators.curation()?;
            match entry_id {
                Some(entry) => {
                    curation.update(store_id, entry, value.clone()).await?;
                }
                None => {
                    curation.create(store_id, value.clone()).await?;
                }
            }
            Ok(())
        }
        Destination::Thread { thread_id } => {
            collaborators
                .threads()?
                .add_message(
                    thread_id,
                    ThreadMessage {
                        role: "assistant".into(),
                        content: stringify(value),
                        name: Some(author.to_string()),
                    },
                )
                .await
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use council_types::PhaseState;

    #[test]
    fn merge_strings_uses_separator() {
        let merged = merge_values(&[json!("a"), json!("b"), json!("c")]);
        assert_eq!(merged, json!("a\n\n---\n\nb\n\n---\n\nc"));
    }

    #[test]
    fn merge_objects_shallow() {
        let merged = merge_values(&[json!({"x": 1}), json!({"y": 2})]);
        assert_eq!(merged, json!({"x": 1, "y": 2}));
    }

    #[test]
    fn merge_arrays_flatten_and_mixed_collects() {
        assert_eq!(merge_values(&[json!([1]), json!([2, 3])]), json!([1, 2, 3]));
        assert_eq!(merge_values(&[json!("a"), json!(1)]), json!(["a", 1]));
        assert_eq!(merge_values(&[Value::Null, json!("only")]), json!("only"));
        assert_eq!(merge_values(&[]), Value::Null);
    }

    #[test]
    fn append_is_type_aware() {
        assert_eq!(append_value(json!("a"), json!("b")), json!("a\n\nb"));
        assert_eq!(append_value(Value::Null, json!("b")), json!("b"));
        assert_eq!(append_value(json!([1]), json!(2)), json!([1, 2]));
        assert_eq!(append_value(json!([1]), json!([2, 3])), json!([1, 2, 3]));
        assert_eq!(append_value(json!({"a": 1}), json!("x")), json!([{"a": 1}, "x"]));
    }

    fn candidates() -> Vec<(String, Value)> {
        vec![
            ("a".into(), json!("first")),
            ("b".into(), json!("second")),
        ]
    }

    #[test]
    fn consolidation_policies() {
        let c = candidates();
        assert_eq!(
            consolidate(Consolidation::Last, &c, &Value::Null, None),
            json!("second")
        );
        assert_eq!(
            consolidate(Consolidation::Last, &c, &json!("first\n\nsecond"), None),
            json!("first\n\nsecond")
        );
        assert_eq!(
            consolidate(Consolidation::First, &c, &Value::Null, None),
            json!("first")
        );
        assert_eq!(
            consolidate(Consolidation::Synthesize, &c, &Value::Null, None),
            json!("first\n\n---\n\nsecond")
        );
        assert_eq!(
            consolidate(Consolidation::Designated, &c, &Value::Null, Some(&json!(42))),
            json!(42)
        );
        let gavel = consolidate(Consolidation::UserGavel, &c, &Value::Null, None);
        assert_eq!(gavel["outputs"]["a"], json!("first"));
        assert_eq!(gavel["merged"], json!("first\n\n---\n\nsecond"));
        assert_eq!(gavel["pending"], json!(true));
    }

    #[test]
    fn set_path_creates_and_appends() {
        let mut globals = Map::new();
        set_path(&mut globals, "story.title", json!("Dawn"), false);
        set_path(&mut globals, "story.notes", json!("one"), true);
        set_path(&mut globals, "story.notes", json!("two"), true);
        assert_eq!(
            Value::Object(globals.clone()),
            json!({"story": {"title": "Dawn", "notes": "one\n\ntwo"}})
        );
        assert_eq!(
            get_path(&Value::Object(globals), "story.title"),
            Some(&json!("Dawn"))
        );
    }

    #[test]
    fn destinations_from_config() {
        let mut phase = Phase {
            id: "p".into(),
            teams: vec!["red".into()],
            ..Phase::default()
        };
        let team = OutputConfig {
            target: OutputTarget::TeamOutput,
            ..OutputConfig::default()
        };
        assert_eq!(
            Destination::from_config(&team, &phase, None).unwrap(),
            Destination::TeamOutput {
                team_id: "red".into(),
                append: false
            }
        );

        let store = OutputConfig {
            target: OutputTarget::Store,
            target_key: "notes.entry-1".into(),
            ..OutputConfig::default()
        };
        let dest = Destination::from_config(&store, &phase, None).unwrap();
        assert_eq!(
            dest,
            Destination::Store {
                store_id: "notes".into(),
                entry_id: Some("entry-1".into())
            }
        );
        assert!(!dest.is_local());

        phase.teams.clear();
        assert!(Destination::from_config(&team, &phase, None).is_err());
        let thread = OutputConfig {
            target: OutputTarget::Thread,
            ..OutputConfig::default()
        };
        assert!(Destination::from_config(&thread, &phase, None).is_err());
        assert_eq!(
            Destination::from_config(&thread, &phase, Some("thread-1")).unwrap(),
            Destination::Thread {
                thread_id: "thread-1".into()
            }
        );
    }

    #[test]
    fn apply_local_updates_run_state() {
        let mut run = Run::new("p", json!("hi"), Map::new());
        run.phases
            .insert("ph".into(), PhaseState::new(Value::Null, Map::new()));

        apply_local(&mut run, "ph", &Destination::PhaseOutput { append: true }, json!("a")).unwrap();
        apply_local(&mut run, "ph", &Destination::PhaseOutput { append: true }, json!("b")).unwrap();
        apply_local(&mut run, "ph", &Destination::NextAction, json!("next")).unwrap();
        apply_local(
            &mut run,
            "ph",
            &Destination::Global {
                path: "summary".into(),
                append: false,
            },
            json!("done"),
        )
        .unwrap();

        let phase = run.phase("ph").unwrap();
        assert_eq!(phase.output, json!("a\n\nb"));
        assert_eq!(phase.next_action_input, Some(json!("next")));
        assert_eq!(run.globals["summary"], json!("done"));
        assert!(apply_local(&mut run, "missing", &Destination::NextAction, json!(1)).is_err());
    }
}
