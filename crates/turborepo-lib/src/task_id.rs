use std::{borrow::Cow, fmt};

use serde::Serialize;

pub const TASK_DELIMITER: &str = "#";
pub const ROOT_PKG_NAME: &str = "//";

/// A task instance: a task run in a particular package. The canonical string
/// form is `package#task`, with `//` as the root package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

impl Serialize for TaskId<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_owned(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn is_root_task(&self) -> bool {
        self.package == ROOT_PKG_NAME
    }

    pub fn into_owned(self) -> TaskId<'static> {
        TaskId {
            package: self.package.into_owned().into(),
            task: self.task.into_owned().into(),
        }
    }

    /// The bare task name, dropping the package qualifier.
    pub fn as_non_workspace_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: None,
            task: self.task.as_ref().into(),
        }
    }
}

impl fmt::Display for TaskId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("'{input}' is not a package task (package#task)")]
pub struct TaskIdParseError {
    input: String,
}

impl TryFrom<&str> for TaskId<'static> {
    type Error = TaskIdParseError;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        match input.split_once(TASK_DELIMITER) {
            // A leading delimiter would produce an empty package name.
            Some(("", _)) | None => Err(TaskIdParseError {
                input: input.to_string(),
            }),
            Some((package, task)) => Ok(TaskId::from_owned(package.to_string(), task.to_string())),
        }
    }
}

/// A task as written in configuration: either a bare name that applies to
/// every package (`build`) or a package-qualified one (`web#build`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

impl Serialize for TaskName<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(raw: &'a str) -> Self {
        match raw.split_once(TASK_DELIMITER) {
            Some((package, task)) if !package.is_empty() => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
            _ => TaskName {
                package: None,
                task: raw.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(raw: String) -> Self {
        let parsed = TaskName::from(raw.as_str());
        parsed.into_owned()
    }
}

impl<'a> TaskName<'a> {
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn is_package_qualified(&self) -> bool {
        self.package.is_some()
    }

    pub fn into_owned(self) -> TaskName<'static> {
        TaskName {
            package: self.package.map(|package| package.into_owned().into()),
            task: self.task.into_owned().into(),
        }
    }

    /// The concrete task id, when the name is package-qualified.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        let package = self.package.as_deref()?;
        Some(TaskId {
            package: package.into(),
            task: self.task.as_ref().into(),
        })
    }

    /// Resolves the bare name against a package, or keeps the explicit
    /// qualifier.
    pub fn task_id_for_package(&self, package: &str) -> TaskId<'static> {
        match self.task_id() {
            Some(task_id) => task_id.into_owned(),
            None => TaskId::from_owned(package.to_string(), self.task.to_string()),
        }
    }
}

impl fmt::Display for TaskName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => f.write_str(&self.task),
        }
    }
}
