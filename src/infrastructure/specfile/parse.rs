//! Spec parsing: a single dispatch over the YAML tag of each node.

use std::collections::BTreeMap;
use std::path::Path;

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::models::{Job, JobArray, JobGroup, JobSpec, MemoryUnit, Resource};

/// Parse a spec document from a file.
pub fn parse_file(path: &Path) -> GatorResult<JobSpec> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| GatorError::Spec(format!("cannot read {}: {err}", path.display())))?;
    parse_str(&text)
}

/// Parse a spec document from a string. The root must carry one of the
/// three node tags.
pub fn parse_str(text: &str) -> GatorResult<JobSpec> {
    let value: Value = serde_yaml::from_str(text)
        .map_err(|err| GatorError::Spec(format!("invalid YAML: {err}")))?;
    let spec = node(&value)?;
    spec.check()?;
    Ok(spec)
}

fn node(value: &Value) -> GatorResult<JobSpec> {
    let tagged = as_tagged(value, "a !Job, !JobGroup, or !JobArray node")?;
    let map = as_mapping(&tagged.value)?;
    match tag_name(tagged).as_str() {
        "Job" => job(map).map(JobSpec::Job),
        "JobGroup" => group(map).map(JobSpec::Group),
        "JobArray" => array(map).map(JobSpec::Array),
        other => Err(GatorError::Spec(format!("unknown node tag '!{other}'"))),
    }
}

fn job(map: &Mapping) -> GatorResult<Job> {
    known_fields(
        map,
        &[
            "ident", "command", "args", "cwd", "env", "resources", "on_done", "on_pass", "on_fail",
        ],
    )?;
    Ok(Job {
        ident: string_field(map, "ident")?,
        command: string_field(map, "command")?,
        args: string_list(map, "args")?,
        cwd: optional_string(map, "cwd")?,
        env: env_map(map)?,
        resources: resources(map)?,
        on_done: string_list(map, "on_done")?,
        on_pass: string_list(map, "on_pass")?,
        on_fail: string_list(map, "on_fail")?,
    })
}

fn group(map: &Mapping) -> GatorResult<JobGroup> {
    known_fields(
        map,
        &["ident", "cwd", "env", "jobs", "on_done", "on_pass", "on_fail"],
    )?;
    Ok(JobGroup {
        ident: string_field(map, "ident")?,
        cwd: optional_string(map, "cwd")?,
        env: env_map(map)?,
        jobs: child_nodes(map)?,
        on_done: string_list(map, "on_done")?,
        on_pass: string_list(map, "on_pass")?,
        on_fail: string_list(map, "on_fail")?,
    })
}

fn array(map: &Mapping) -> GatorResult<JobArray> {
    known_fields(
        map,
        &[
            "ident", "repeats", "cwd", "env", "jobs", "on_done", "on_pass", "on_fail",
        ],
    )?;
    let repeats = match field(map, "repeats") {
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| GatorError::Spec("repeats must be a positive integer".into()))?,
        None => 1,
    };
    Ok(JobArray {
        ident: string_field(map, "ident")?,
        repeats,
        cwd: optional_string(map, "cwd")?,
        env: env_map(map)?,
        jobs: child_nodes(map)?,
        on_done: string_list(map, "on_done")?,
        on_pass: string_list(map, "on_pass")?,
        on_fail: string_list(map, "on_fail")?,
    })
}

fn resources(map: &Mapping) -> GatorResult<Vec<Resource>> {
    let Some(value) = field(map, "resources") else {
        return Ok(Vec::new());
    };
    let seq = value
        .as_sequence()
        .ok_or_else(|| GatorError::Spec("resources must be a list".into()))?;
    seq.iter().map(resource).collect()
}

/// Resource tags accept both sequence form (`!Cores [2]`) and mapping form
/// (`!Cores {count: 2}`).
fn resource(value: &Value) -> GatorResult<Resource> {
    let tagged = as_tagged(value, "a !Cores, !Memory, or !License request")?;
    match tag_name(tagged).as_str() {
        "Cores" => {
            let count = match &tagged.value {
                Value::Sequence(seq) => positional_u32(seq, 0, "count")?,
                Value::Mapping(map) => u32_field(map, "count")?
                    .ok_or_else(|| GatorError::Spec("!Cores requires a count".into()))?,
                _ => return Err(GatorError::Spec("!Cores expects [n] or {count: n}".into())),
            };
            Ok(Resource::Cores { count })
        }
        "Memory" => {
            let (size, unit) = match &tagged.value {
                Value::Sequence(seq) => {
                    let size = positional_u64(seq, 0, "size")?;
                    let unit = seq.get(1).map(value_to_string).transpose()?;
                    (size, unit)
                }
                Value::Mapping(map) => {
                    let size = u64_field(map, "size")?
                        .ok_or_else(|| GatorError::Spec("!Memory requires a size".into()))?;
                    (size, optional_string(map, "unit")?)
                }
                _ => {
                    return Err(GatorError::Spec(
                        "!Memory expects [size, unit] or {size, unit}".into(),
                    ))
                }
            };
            let unit = match unit {
                Some(name) => MemoryUnit::from_str(&name)
                    .ok_or_else(|| GatorError::Spec(format!("unknown memory unit '{name}'")))?,
                None => MemoryUnit::MB,
            };
            Ok(Resource::Memory { size, unit })
        }
        "License" => {
            let (name, count) = match &tagged.value {
                Value::Sequence(seq) => {
                    let name = seq
                        .first()
                        .map(value_to_string)
                        .transpose()?
                        .ok_or_else(|| GatorError::Spec("!License requires a name".into()))?;
                    let count = match seq.get(1) {
                        Some(value) => value.as_u64().and_then(|n| u32::try_from(n).ok()).ok_or_else(
                            || GatorError::Spec("license count must be an integer".into()),
                        )?,
                        None => 1,
                    };
                    (name, count)
                }
                Value::Mapping(map) => {
                    let name = optional_string(map, "name")?
                        .ok_or_else(|| GatorError::Spec("!License requires a name".into()))?;
                    (name, u32_field(map, "count")?.unwrap_or(1))
                }
                _ => {
                    return Err(GatorError::Spec(
                        "!License expects [name, count] or {name, count}".into(),
                    ))
                }
            };
            Ok(Resource::License { name, count })
        }
        other => Err(GatorError::Spec(format!("unknown resource tag '!{other}'"))),
    }
}

fn child_nodes(map: &Mapping) -> GatorResult<Vec<JobSpec>> {
    let Some(value) = field(map, "jobs") else {
        return Ok(Vec::new());
    };
    let seq = value
        .as_sequence()
        .ok_or_else(|| GatorError::Spec("jobs must be a list".into()))?;
    seq.iter().map(node).collect()
}

fn as_tagged<'a>(value: &'a Value, expected: &str) -> GatorResult<&'a TaggedValue> {
    match value {
        Value::Tagged(tagged) => Ok(tagged),
        _ => Err(GatorError::Spec(format!("expected {expected}"))),
    }
}

fn tag_name(tagged: &TaggedValue) -> String {
    tagged.tag.to_string().trim_start_matches('!').to_string()
}

fn as_mapping(value: &Value) -> GatorResult<&Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| GatorError::Spec("node body must be a mapping".into()))
}

fn field<'a>(map: &'a Mapping, name: &str) -> Option<&'a Value> {
    map.get(&Value::String(name.to_string()))
}

fn known_fields(map: &Mapping, allowed: &[&str]) -> GatorResult<()> {
    for key in map.keys() {
        let name = key
            .as_str()
            .ok_or_else(|| GatorError::Spec("field names must be strings".into()))?;
        if !allowed.contains(&name) {
            return Err(GatorError::Spec(format!("unknown field '{name}'")));
        }
    }
    Ok(())
}

fn string_field(map: &Mapping, name: &str) -> GatorResult<String> {
    optional_string(map, name)?
        .ok_or_else(|| GatorError::Spec(format!("missing required field '{name}'")))
}

fn optional_string(map: &Mapping, name: &str) -> GatorResult<Option<String>> {
    field(map, name).map(value_to_string).transpose()
}

fn string_list(map: &Mapping, name: &str) -> GatorResult<Vec<String>> {
    let Some(value) = field(map, name) else {
        return Ok(Vec::new());
    };
    let seq = value
        .as_sequence()
        .ok_or_else(|| GatorError::Spec(format!("{name} must be a list")))?;
    seq.iter().map(value_to_string).collect()
}

fn env_map(map: &Mapping) -> GatorResult<BTreeMap<String, String>> {
    let Some(value) = field(map, "env") else {
        return Ok(BTreeMap::new());
    };
    let mapping = value
        .as_mapping()
        .ok_or_else(|| GatorError::Spec("env must be a mapping".into()))?;
    let mut env = BTreeMap::new();
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| GatorError::Spec("env keys must be strings".into()))?;
        env.insert(name.to_string(), value_to_string(value)?);
    }
    Ok(env)
}

/// Strings and integers are accepted wherever a string is expected.
fn value_to_string(value: &Value) -> GatorResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(GatorError::Spec(format!(
            "expected a string or integer, found {value:?}"
        ))),
    }
}

fn positional_u32(seq: &[Value], index: usize, what: &str) -> GatorResult<u32> {
    seq.get(index)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| GatorError::Spec(format!("{what} must be an integer")))
}

fn positional_u64(seq: &[Value], index: usize, what: &str) -> GatorResult<u64> {
    seq.get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| GatorError::Spec(format!("{what} must be an integer")))
}

fn u32_field(map: &Mapping, name: &str) -> GatorResult<Option<u32>> {
    match field(map, name) {
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| GatorError::Spec(format!("{name} must be an integer"))),
        None => Ok(None),
    }
}

fn u64_field(map: &Mapping, name: &str) -> GatorResult<Option<u64>> {
    match field(map, name) {
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| GatorError::Spec(format!("{name} must be an integer"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_job() {
        let spec = parse_str("!Job\nident: hello\ncommand: echo\nargs: [hi]\n").unwrap();
        match spec {
            JobSpec::Job(job) => {
                assert_eq!(job.ident, "hello");
                assert_eq!(job.command, "echo");
                assert_eq!(job.args, vec!["hi"]);
            }
            _ => panic!("expected a job"),
        }
    }

    #[test]
    fn test_parse_group_with_dependencies() {
        let text = "\
!JobGroup
ident: g
jobs:
  - !Job
    ident: A
    command: echo
    args: [a]
  - !Job
    ident: B
    command: echo
    args: [b]
    on_pass: [A]
";
        let spec = parse_str(text).unwrap();
        match &spec {
            JobSpec::Group(group) => {
                assert_eq!(group.jobs.len(), 2);
                assert_eq!(group.jobs[1].on_pass(), &["A".to_string()]);
            }
            _ => panic!("expected a group"),
        }
    }

    #[test]
    fn test_parse_array_with_env_and_resources() {
        let text = "\
!JobArray
ident: arr
repeats: 3
env:
  ROUNDS: 3
jobs:
  - !Job
    ident: c
    command: echo
    args: [\"$GATOR_ARRAY_INDEX\"]
    resources:
      - !Cores [2]
      - !Memory {size: 512, unit: MB}
      - !License {name: simulator}
";
        let spec = parse_str(text).unwrap();
        match &spec {
            JobSpec::Array(array) => {
                assert_eq!(array.repeats, 3);
                assert_eq!(array.env.get("ROUNDS"), Some(&"3".to_string()));
                match &array.jobs[0] {
                    JobSpec::Job(job) => {
                        assert_eq!(job.resources.len(), 3);
                        assert_eq!(job.resources[0], Resource::Cores { count: 2 });
                        assert_eq!(
                            job.resources[2],
                            Resource::License {
                                name: "simulator".into(),
                                count: 1
                            }
                        );
                    }
                    _ => panic!("expected a job"),
                }
            }
            _ => panic!("expected an array"),
        }
    }

    #[test]
    fn test_memory_sequence_form() {
        let text = "!Job\nident: j\ncommand: x\nresources: [!Memory [4, GB]]\n";
        let spec = parse_str(text).unwrap();
        match spec {
            JobSpec::Job(job) => assert_eq!(
                job.resources[0],
                Resource::Memory {
                    size: 4,
                    unit: MemoryUnit::GB
                }
            ),
            _ => panic!("expected a job"),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(parse_str("!Pipeline\nident: x\n").is_err());
    }

    #[test]
    fn test_untagged_root_rejected() {
        assert!(parse_str("ident: x\ncommand: echo\n").is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_str("!Job\nident: x\ncommand: echo\nbogus: 1\n").is_err());
    }

    #[test]
    fn test_repeats_zero_rejected() {
        let text = "!JobArray\nident: a\nrepeats: 0\njobs:\n  - !Job\n    ident: c\n    command: x\n";
        assert!(parse_str(text).is_err());
    }
}
