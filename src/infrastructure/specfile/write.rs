//! Spec serialization back to tagged YAML.

use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::models::{Job, JobArray, JobGroup, JobSpec, Resource};

/// Serialize a spec node to YAML, tags included. Parsing the output yields
/// a structure equal to the input (modulo whitespace and key order).
pub fn to_yaml(spec: &JobSpec) -> GatorResult<String> {
    serde_yaml::to_string(&node_value(spec))
        .map_err(|err| GatorError::Spec(format!("cannot serialize spec: {err}")))
}

fn node_value(spec: &JobSpec) -> Value {
    match spec {
        JobSpec::Job(job) => tagged("Job", job_mapping(job)),
        JobSpec::Group(group) => tagged("JobGroup", group_mapping(group)),
        JobSpec::Array(array) => tagged("JobArray", array_mapping(array)),
    }
}

fn job_mapping(job: &Job) -> Mapping {
    let mut map = Mapping::new();
    insert_str(&mut map, "ident", &job.ident);
    insert_str(&mut map, "command", &job.command);
    if !job.args.is_empty() {
        insert_list(&mut map, "args", &job.args);
    }
    if let Some(cwd) = &job.cwd {
        insert_str(&mut map, "cwd", cwd);
    }
    insert_env(&mut map, &job.env);
    if !job.resources.is_empty() {
        let values: Vec<Value> = job.resources.iter().map(resource_value).collect();
        map.insert(Value::from("resources"), Value::Sequence(values));
    }
    insert_deps(&mut map, &job.on_done, &job.on_pass, &job.on_fail);
    map
}

fn group_mapping(group: &JobGroup) -> Mapping {
    let mut map = Mapping::new();
    insert_str(&mut map, "ident", &group.ident);
    if let Some(cwd) = &group.cwd {
        insert_str(&mut map, "cwd", cwd);
    }
    insert_env(&mut map, &group.env);
    insert_jobs(&mut map, &group.jobs);
    insert_deps(&mut map, &group.on_done, &group.on_pass, &group.on_fail);
    map
}

fn array_mapping(array: &JobArray) -> Mapping {
    let mut map = Mapping::new();
    insert_str(&mut map, "ident", &array.ident);
    map.insert(Value::from("repeats"), Value::from(array.repeats));
    if let Some(cwd) = &array.cwd {
        insert_str(&mut map, "cwd", cwd);
    }
    insert_env(&mut map, &array.env);
    insert_jobs(&mut map, &array.jobs);
    insert_deps(&mut map, &array.on_done, &array.on_pass, &array.on_fail);
    map
}

fn resource_value(resource: &Resource) -> Value {
    match resource {
        Resource::Cores { count } => {
            let mut map = Mapping::new();
            map.insert(Value::from("count"), Value::from(*count));
            tagged("Cores", map)
        }
        Resource::Memory { size, unit } => {
            let mut map = Mapping::new();
            map.insert(Value::from("size"), Value::from(*size));
            map.insert(Value::from("unit"), Value::from(unit.as_str()));
            tagged("Memory", map)
        }
        Resource::License { name, count } => {
            let mut map = Mapping::new();
            map.insert(Value::from("name"), Value::from(name.as_str()));
            map.insert(Value::from("count"), Value::from(*count));
            tagged("License", map)
        }
    }
}

fn tagged(tag: &str, map: Mapping) -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(tag),
        value: Value::Mapping(map),
    }))
}

fn insert_str(map: &mut Mapping, name: &str, value: &str) {
    map.insert(Value::from(name), Value::from(value));
}

fn insert_list(map: &mut Mapping, name: &str, values: &[String]) {
    let seq: Vec<Value> = values.iter().map(|v| Value::from(v.as_str())).collect();
    map.insert(Value::from(name), Value::Sequence(seq));
}

fn insert_env(map: &mut Mapping, env: &std::collections::BTreeMap<String, String>) {
    if env.is_empty() {
        return;
    }
    let mut mapping = Mapping::new();
    for (key, value) in env {
        mapping.insert(Value::from(key.as_str()), Value::from(value.as_str()));
    }
    map.insert(Value::from("env"), Value::Mapping(mapping));
}

fn insert_jobs(map: &mut Mapping, jobs: &[JobSpec]) {
    let seq: Vec<Value> = jobs.iter().map(node_value).collect();
    map.insert(Value::from("jobs"), Value::Sequence(seq));
}

fn insert_deps(map: &mut Mapping, on_done: &[String], on_pass: &[String], on_fail: &[String]) {
    if !on_done.is_empty() {
        insert_list(map, "on_done", on_done);
    }
    if !on_pass.is_empty() {
        insert_list(map, "on_pass", on_pass);
    }
    if !on_fail.is_empty() {
        insert_list(map, "on_fail", on_fail);
    }
}
