//! Parsed build instructions.
//!
//! The worker never lexes Dockerfiles: instructions arrive already parsed
//! inside a build unit and are handed to the step executor untouched.

use serde::{Deserialize, Serialize};

/// A single parsed Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "keyword", rename_all = "UPPERCASE")]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    /// `RUN <command>` (shell form)
    Run { command: String },
    /// `COPY [--from=<stage>] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// `ADD <src>... <dst>` (local sources only)
    Add { src: Vec<String>, dst: String },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value>`
    Env { key: String, value: String },
    /// `ENTRYPOINT ["exec", "form"]`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>]`
    Expose { port: String },
    /// `LABEL <key>=<value>`
    Label { key: String, value: String },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// `VOLUME <path>`
    Volume { path: String },
}

impl Instruction {
    /// Upper-case Dockerfile keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Label { .. } => "LABEL",
            Instruction::User { .. } => "USER",
            Instruction::Arg { .. } => "ARG",
            Instruction::Volume { .. } => "VOLUME",
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::From { image, alias } => match alias {
                Some(a) => write!(f, "FROM {} AS {}", image, a),
                None => write!(f, "FROM {}", image),
            },
            Instruction::Run { command } => write!(f, "RUN {}", command),
            Instruction::Copy { src, dst, from } => match from {
                Some(stage) => write!(f, "COPY --from={} {} {}", stage, src.join(" "), dst),
                None => write!(f, "COPY {} {}", src.join(" "), dst),
            },
            Instruction::Add { src, dst } => write!(f, "ADD {} {}", src.join(" "), dst),
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Env { key, value } => write!(f, "ENV {}={}", key, value),
            Instruction::Entrypoint { exec } => write!(f, "ENTRYPOINT {:?}", exec),
            Instruction::Cmd { exec } => write!(f, "CMD {:?}", exec),
            Instruction::Expose { port } => write!(f, "EXPOSE {}", port),
            Instruction::Label { key, value } => write!(f, "LABEL {}={}", key, value),
            Instruction::User { user } => write!(f, "USER {}", user),
            Instruction::Arg { name, default } => match default {
                Some(d) => write!(f, "ARG {}={}", name, d),
                None => write!(f, "ARG {}", name),
            },
            Instruction::Volume { path } => write!(f, "VOLUME {}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_wire_form() {
        let instr = Instruction::Run {
            command: "apk add --no-cache curl".to_string(),
        };
        let json = serde_json::to_value(&instr).unwrap();
        assert_eq!(json["keyword"], "RUN");
        assert_eq!(json["command"], "apk add --no-cache curl");
    }

    #[test]
    fn test_copy_without_stage_omits_from() {
        let instr = Instruction::Copy {
            src: vec!["app.py".to_string()],
            dst: "/app/".to_string(),
            from: None,
        };
        let json = serde_json::to_string(&instr).unwrap();
        assert!(!json.contains("\"from\""));
    }

    #[test]
    fn test_workdir_keyword_casing() {
        let parsed: Instruction =
            serde_json::from_str(r#"{"keyword":"WORKDIR","path":"/srv"}"#).unwrap();
        assert_eq!(
            parsed,
            Instruction::Workdir {
                path: "/srv".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_keyword_rejected() {
        let parsed: Result<Instruction, _> =
            serde_json::from_str(r#"{"keyword":"HEALTHCHECK","cmd":"true"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_display_matches_dockerfile_syntax() {
        let instr = Instruction::Copy {
            src: vec!["a".to_string(), "b".to_string()],
            dst: "/dst".to_string(),
            from: Some("builder".to_string()),
        };
        assert_eq!(instr.to_string(), "COPY --from=builder a b /dst");
        assert_eq!(
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: Some("3.19".to_string())
            }
            .to_string(),
            "ARG VERSION=3.19"
        );
    }
}
