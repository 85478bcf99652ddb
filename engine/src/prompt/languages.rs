//! Fixed language → command table (spec §4.5). Unknown languages get a command that
//! simply names the missing configuration rather than failing the prompt build.

pub struct LanguageCommands {
    pub test_cmd: &'static str,
    pub lint_cmd: &'static str,
}

pub const DEFAULT_LANGUAGE: &str = "ruby";

pub fn commands_for(language: &str) -> LanguageCommands {
    match language {
        "ruby" => LanguageCommands {
            test_cmd: "bundle exec rspec",
            lint_cmd: "bundle exec rubocop",
        },
        "javascript" => LanguageCommands {
            test_cmd: "npm test",
            lint_cmd: "npm run lint",
        },
        "typescript" => LanguageCommands {
            test_cmd: "npm test",
            lint_cmd: "npm run lint",
        },
        "python" => LanguageCommands {
            test_cmd: "pytest",
            lint_cmd: "ruff check .",
        },
        "go" => LanguageCommands {
            test_cmd: "go test ./...",
            lint_cmd: "golangci-lint run",
        },
        "rust" => LanguageCommands {
            test_cmd: "cargo test",
            lint_cmd: "cargo clippy",
        },
        _ => LanguageCommands {
            test_cmd: "echo \"No test command configured\"",
            lint_cmd: "echo \"No lint command configured\"",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_languages_map_to_fixed_commands() {
        assert_eq!(commands_for("rust").test_cmd, "cargo test");
        assert_eq!(commands_for("python").lint_cmd, "ruff check .");
    }

    #[test]
    fn unknown_language_falls_back_to_placeholder() {
        let cmds = commands_for("cobol");
        assert!(cmds.test_cmd.contains("No test command configured"));
        assert!(cmds.lint_cmd.contains("No lint command configured"));
    }
}
