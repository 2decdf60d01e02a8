//! Job tree specification model.
//!
//! A spec is a tagged tree of three node kinds: a `Job` runs one shell
//! command, a `JobGroup` collects children, and a `JobArray` repeats its
//! children N times. Tiers interpret groups and arrays; wrappers interpret
//! jobs.

use std::collections::BTreeMap;

use crate::domain::errors::{GatorError, GatorResult};
use crate::domain::models::resource::Resource;

/// Environment variable carrying the array index into expanded children.
pub const ARRAY_INDEX_ENV: &str = "GATOR_ARRAY_INDEX";

/// A single shell task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Job {
    pub ident: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub resources: Vec<Resource>,
    pub on_done: Vec<String>,
    pub on_pass: Vec<String>,
    pub on_fail: Vec<String>,
}

/// A static collection of child nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobGroup {
    pub ident: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub jobs: Vec<JobSpec>,
    pub on_done: Vec<String>,
    pub on_pass: Vec<String>,
    pub on_fail: Vec<String>,
}

/// A collection of child nodes repeated `repeats` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArray {
    pub ident: String,
    pub repeats: u32,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub jobs: Vec<JobSpec>,
    pub on_done: Vec<String>,
    pub on_pass: Vec<String>,
    pub on_fail: Vec<String>,
}

/// A node of the specification tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    Job(Job),
    Group(JobGroup),
    Array(JobArray),
}

/// One direct child produced by expanding a tier's spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedChild {
    pub ident: String,
    pub spec: JobSpec,
}

impl JobSpec {
    pub fn ident(&self) -> &str {
        match self {
            Self::Job(j) => &j.ident,
            Self::Group(g) => &g.ident,
            Self::Array(a) => &a.ident,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Job(_))
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        match self {
            Self::Job(j) => &j.env,
            Self::Group(g) => &g.env,
            Self::Array(a) => &a.env,
        }
    }

    pub fn cwd(&self) -> Option<&str> {
        match self {
            Self::Job(j) => j.cwd.as_deref(),
            Self::Group(g) => g.cwd.as_deref(),
            Self::Array(a) => a.cwd.as_deref(),
        }
    }

    pub fn on_done(&self) -> &[String] {
        match self {
            Self::Job(j) => &j.on_done,
            Self::Group(g) => &g.on_done,
            Self::Array(a) => &a.on_done,
        }
    }

    pub fn on_pass(&self) -> &[String] {
        match self {
            Self::Job(j) => &j.on_pass,
            Self::Group(g) => &g.on_pass,
            Self::Array(a) => &a.on_pass,
        }
    }

    pub fn on_fail(&self) -> &[String] {
        match self {
            Self::Job(j) => &j.on_fail,
            Self::Group(g) => &g.on_fail,
            Self::Array(a) => &a.on_fail,
        }
    }

    /// Number of leaf jobs in this subtree. Tiers use this to seed
    /// `sub_total` before their children report in.
    pub fn expected_leaves(&self) -> u64 {
        match self {
            Self::Job(_) => 1,
            Self::Group(g) => g.jobs.iter().map(JobSpec::expected_leaves).sum(),
            Self::Array(a) => {
                let per_round: u64 = a.jobs.iter().map(JobSpec::expected_leaves).sum();
                u64::from(a.repeats) * per_round
            }
        }
    }

    /// Validate this node and its subtree.
    pub fn check(&self) -> GatorResult<()> {
        if self.ident().is_empty() {
            return Err(GatorError::Spec("node is missing an ident".into()));
        }
        match self {
            Self::Job(job) => {
                if job.command.is_empty() {
                    return Err(GatorError::Spec(format!(
                        "job '{}' has no command",
                        job.ident
                    )));
                }
                Resource::check_list(&job.resources)
            }
            Self::Group(group) => check_children(&group.ident, &group.jobs),
            Self::Array(array) => {
                if array.repeats == 0 {
                    return Err(GatorError::Spec(format!(
                        "array '{}' has repeats of zero",
                        array.ident
                    )));
                }
                check_children(&array.ident, &array.jobs)
            }
        }
    }

    fn set_env(&mut self, env: BTreeMap<String, String>) {
        match self {
            Self::Job(j) => j.env = env,
            Self::Group(g) => g.env = env,
            Self::Array(a) => a.env = env,
        }
    }

    fn set_cwd(&mut self, cwd: Option<String>) {
        match self {
            Self::Job(j) => j.cwd = cwd,
            Self::Group(g) => g.cwd = cwd,
            Self::Array(a) => a.cwd = cwd,
        }
    }

    fn set_ident(&mut self, ident: String) {
        match self {
            Self::Job(j) => j.ident = ident,
            Self::Group(g) => g.ident = ident,
            Self::Array(a) => a.ident = ident,
        }
    }

    fn set_deps(&mut self, on_done: Vec<String>, on_pass: Vec<String>, on_fail: Vec<String>) {
        match self {
            Self::Job(j) => {
                j.on_done = on_done;
                j.on_pass = on_pass;
                j.on_fail = on_fail;
            }
            Self::Group(g) => {
                g.on_done = on_done;
                g.on_pass = on_pass;
                g.on_fail = on_fail;
            }
            Self::Array(a) => {
                a.on_done = on_done;
                a.on_pass = on_pass;
                a.on_fail = on_fail;
            }
        }
    }

    /// Expand this tier-level node (a group or array) into its direct
    /// children.
    ///
    /// The parent's environment is overlaid under each child's, the parent's
    /// working directory propagates where the child sets none, and arrays
    /// with `repeats > 1` synthesize one child per repeat with the array
    /// index appended to the ident and injected into the environment.
    /// Dependency lists are rewritten to expanded idents; a dependency on an
    /// array template resolves to all of its expansions.
    pub fn expand_children(&self) -> GatorResult<Vec<ExpandedChild>> {
        self.check()?;
        let (jobs, repeats) = match self {
            Self::Group(group) => (&group.jobs, 1u32),
            Self::Array(array) => (&array.jobs, array.repeats),
            Self::Job(_) => {
                return Err(GatorError::Spec(
                    "a leaf job has no children to expand".into(),
                ))
            }
        };
        // `repeats == 1` behaves exactly like a plain group.
        let indexed = repeats > 1;

        // Template ident -> expanded idents, for dependency rewriting.
        let mut expanded_of: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for job in jobs {
            let names = if indexed {
                (0..repeats).map(|i| format!("{}_{i}", job.ident())).collect()
            } else {
                vec![job.ident().to_string()]
            };
            expanded_of.insert(job.ident().to_string(), names);
        }

        let mut children = Vec::new();
        for job in jobs {
            let on_done = rewrite_deps(job.ident(), job.on_done(), &expanded_of)?;
            let on_pass = rewrite_deps(job.ident(), job.on_pass(), &expanded_of)?;
            let on_fail = rewrite_deps(job.ident(), job.on_fail(), &expanded_of)?;
            for index in 0..if indexed { repeats } else { 1 } {
                let mut child = job.clone();
                // Parent values sit underneath the child's own entries.
                let mut env = self.env().clone();
                env.extend(child.env().clone());
                if indexed {
                    env.insert(ARRAY_INDEX_ENV.to_string(), index.to_string());
                    child.set_ident(format!("{}_{index}", job.ident()));
                }
                child.set_env(env);
                if child.cwd().is_none() {
                    child.set_cwd(self.cwd().map(str::to_string));
                }
                child.set_deps(on_done.clone(), on_pass.clone(), on_fail.clone());
                children.push(ExpandedChild {
                    ident: child.ident().to_string(),
                    spec: child,
                });
            }
        }
        Ok(children)
    }
}

fn check_children(parent: &str, jobs: &[JobSpec]) -> GatorResult<()> {
    let mut seen = std::collections::BTreeSet::new();
    for job in jobs {
        if !seen.insert(job.ident().to_string()) {
            return Err(GatorError::Spec(format!(
                "duplicated ident '{}' under '{parent}'",
                job.ident()
            )));
        }
        job.check()?;
    }
    Ok(())
}

fn rewrite_deps(
    ident: &str,
    deps: &[String],
    expanded_of: &BTreeMap<String, Vec<String>>,
) -> GatorResult<Vec<String>> {
    let mut resolved = Vec::new();
    for dep in deps {
        if dep.as_str() == ident {
            return Err(GatorError::Spec(format!("'{ident}' depends on itself")));
        }
        match expanded_of.get(dep) {
            Some(names) => resolved.extend(names.iter().cloned()),
            None => {
                return Err(GatorError::Spec(format!(
                    "unknown dependency '{dep}' of '{ident}'"
                )))
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(ident: &str) -> JobSpec {
        JobSpec::Job(Job {
            ident: ident.into(),
            command: "echo".into(),
            args: vec![ident.into()],
            ..Job::default()
        })
    }

    #[test]
    fn test_expected_leaves() {
        let group = JobSpec::Group(JobGroup {
            ident: "g".into(),
            jobs: vec![job("a"), job("b")],
            ..JobGroup::default()
        });
        assert_eq!(group.expected_leaves(), 2);

        let array = JobSpec::Array(JobArray {
            ident: "arr".into(),
            repeats: 3,
            cwd: None,
            env: BTreeMap::new(),
            jobs: vec![group],
            on_done: vec![],
            on_pass: vec![],
            on_fail: vec![],
        });
        assert_eq!(array.expected_leaves(), 6);
    }

    #[test]
    fn test_group_expansion_keeps_idents() {
        let group = JobSpec::Group(JobGroup {
            ident: "g".into(),
            jobs: vec![job("a"), job("b")],
            ..JobGroup::default()
        });
        let children = group.expand_children().unwrap();
        let idents: Vec<_> = children.iter().map(|c| c.ident.as_str()).collect();
        assert_eq!(idents, vec!["a", "b"]);
    }

    #[test]
    fn test_array_expansion_suffixes_and_env() {
        let array = JobSpec::Array(JobArray {
            ident: "arr".into(),
            repeats: 3,
            cwd: None,
            env: BTreeMap::new(),
            jobs: vec![job("c")],
            on_done: vec![],
            on_pass: vec![],
            on_fail: vec![],
        });
        let children = array.expand_children().unwrap();
        let idents: Vec<_> = children.iter().map(|c| c.ident.as_str()).collect();
        assert_eq!(idents, vec!["c_0", "c_1", "c_2"]);
        assert_eq!(
            children[1].spec.env().get(ARRAY_INDEX_ENV),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn test_array_repeats_one_is_a_group() {
        let array = JobSpec::Array(JobArray {
            ident: "arr".into(),
            repeats: 1,
            cwd: None,
            env: BTreeMap::new(),
            jobs: vec![job("c")],
            on_done: vec![],
            on_pass: vec![],
            on_fail: vec![],
        });
        let children = array.expand_children().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].ident, "c");
        assert!(children[0].spec.env().get(ARRAY_INDEX_ENV).is_none());
    }

    #[test]
    fn test_array_repeats_zero_rejected() {
        let array = JobSpec::Array(JobArray {
            ident: "arr".into(),
            repeats: 0,
            cwd: None,
            env: BTreeMap::new(),
            jobs: vec![job("c")],
            on_done: vec![],
            on_pass: vec![],
            on_fail: vec![],
        });
        assert!(array.expand_children().is_err());
    }

    #[test]
    fn test_dependency_on_array_template_fans_out() {
        let mut b = Job {
            ident: "b".into(),
            command: "echo".into(),
            ..Job::default()
        };
        b.on_pass = vec!["a".into()];
        let array = JobSpec::Array(JobArray {
            ident: "arr".into(),
            repeats: 2,
            cwd: None,
            env: BTreeMap::new(),
            jobs: vec![job("a"), JobSpec::Job(b)],
            on_done: vec![],
            on_pass: vec![],
            on_fail: vec![],
        });
        let children = array.expand_children().unwrap();
        let b0 = children.iter().find(|c| c.ident == "b_0").unwrap();
        assert_eq!(b0.spec.on_pass(), &["a_0".to_string(), "a_1".to_string()]);
    }

    #[test]
    fn test_env_and_cwd_inheritance() {
        let mut env = BTreeMap::new();
        env.insert("SHARED".to_string(), "parent".to_string());
        env.insert("OWN".to_string(), "parent".to_string());
        let mut child_env = BTreeMap::new();
        child_env.insert("OWN".to_string(), "child".to_string());
        let group = JobSpec::Group(JobGroup {
            ident: "g".into(),
            cwd: Some("/work".into()),
            env,
            jobs: vec![JobSpec::Job(Job {
                ident: "a".into(),
                command: "true".into(),
                env: child_env,
                ..Job::default()
            })],
            ..JobGroup::default()
        });
        let children = group.expand_children().unwrap();
        let spec = &children[0].spec;
        assert_eq!(spec.env().get("SHARED"), Some(&"parent".to_string()));
        assert_eq!(spec.env().get("OWN"), Some(&"child".to_string()));
        assert_eq!(spec.cwd(), Some("/work"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut a = Job {
            ident: "a".into(),
            command: "true".into(),
            ..Job::default()
        };
        a.on_done = vec!["missing".into()];
        let group = JobSpec::Group(JobGroup {
            ident: "g".into(),
            jobs: vec![JobSpec::Job(a)],
            ..JobGroup::default()
        });
        assert!(group.expand_children().is_err());
    }

    #[test]
    fn test_duplicate_idents_rejected() {
        let group = JobSpec::Group(JobGroup {
            ident: "g".into(),
            jobs: vec![job("a"), job("a")],
            ..JobGroup::default()
        });
        assert!(group.check().is_err());
    }
}
