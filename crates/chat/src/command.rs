use shared::slug::Slug;

/// A recognized bot invocation. Everything else in the channel is team
/// chatter and is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register { name: String },
    Solved { slug: Slug },
    Archive { slug: Slug },
    Status { slug: Option<Slug> },
    Recount,
}

/// Parses a raw chat message against the configured prefix.
///
/// Grammar: `<prefix>register <name...>`, `<prefix>solved <slug>`,
/// `<prefix>archive <slug>`, `<prefix>status [slug]`, `<prefix>recount`.
/// Slug arguments are normalized through the codec, so `!solved Foo Bar`
/// and `!solved foo-bar` name the same puzzle.
pub fn parse_command(prefix: &str, raw: &str) -> Option<Command> {
    let rest = raw.trim().strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let keyword = words.next()?;
    match keyword {
        "register" => {
            let name = words.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return None;
            }
            Some(Command::Register { name })
        }
        "solved" | "archive" => {
            let arg = words.collect::<Vec<_>>().join(" ");
            if arg.is_empty() {
                return None;
            }
            let slug = Slug::new(&arg);
            Some(if keyword == "solved" {
                Command::Solved { slug }
            } else {
                Command::Archive { slug }
            })
        }
        "status" => {
            let arg = words.collect::<Vec<_>>().join(" ");
            let slug = if arg.is_empty() {
                None
            } else {
                Some(Slug::new(&arg))
            };
            Some(Command::Status { slug })
        }
        "recount" => Some(Command::Recount),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/command_tests.rs"]
mod tests;
