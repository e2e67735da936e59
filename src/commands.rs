//! Remote-control commands received over private messages.
//!
//! A command line is parsed into an [`Invocation`], looked up in a fixed
//! table of [`CommandSpec`]s, run through the guard chain and then
//! dispatched to its handler against the agent's transport.

use std::fmt;

use crate::duties::DutyGroup;
use crate::error::TransportError;
use crate::transport::{AgentTransport, Goal};
use crate::whitelist::Whitelist;

pub const DUTY_REFUSAL: &str = "I'm on this farm duty, can't comply";
pub const UNAUTHORIZED_REFUSAL: &str = "You are not authorized to control this bot.";
pub const INVALID_DISTANCE: &str = "Invalid follow distance. Please provide a number.";
pub const NOT_VISIBLE: &str = "I can't see you.";
pub const FOLLOW_FAILED: &str = "Error setting follow goal.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    Say,
    TpMe,
    TpHere,
    Follow,
}

/// Arguments a command expects after its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// Any number of words.
    Text,
    /// Nothing besides an optional password.
    Empty,
    /// A fixed keyword followed by a number.
    KeywordNumber(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    /// `None` for names that are recognised by the guards but have no handler.
    pub handler: Option<CommandName>,
    pub args: ArgShape,
    /// Moves the agent or another player; blocked while on a locked farm.
    pub teleport: bool,
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "say",
        handler: Some(CommandName::Say),
        args: ArgShape::Text,
        teleport: false,
    },
    CommandSpec {
        name: "tpme",
        handler: Some(CommandName::TpMe),
        args: ArgShape::Empty,
        teleport: true,
    },
    CommandSpec {
        name: "tphere",
        handler: Some(CommandName::TpHere),
        args: ArgShape::Empty,
        teleport: true,
    },
    CommandSpec {
        name: "follow",
        handler: Some(CommandName::Follow),
        args: ArgShape::KeywordNumber("me"),
        teleport: true,
    },
    CommandSpec {
        name: "tpa",
        handler: None,
        args: ArgShape::Empty,
        teleport: true,
    },
];

/// A tokenized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Lower-cased first token.
    pub name: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn parse(text: &str) -> Option<Self> {
        let mut tokens = text.split_whitespace();
        let name = tokens.next()?.to_lowercase();
        Some(Self {
            name,
            args: tokens.map(ToOwned::to_owned).collect(),
        })
    }

    /// The trailing token, offered as the command password.
    pub fn password_candidate(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }

    pub fn spec(&self) -> Option<&'static CommandSpec> {
        COMMANDS.iter().find(|spec| spec.name == self.name)
    }

    pub fn is_teleport(&self) -> bool {
        self.spec().is_some_and(|spec| spec.teleport)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Reduce a display name such as `[Admin] alice` to the bare username.
pub fn base_username(sender: &str) -> &str {
    sender.split_whitespace().last().unwrap_or(sender)
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Why a command was not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    DutyLocked,
    Unauthorized,
}

impl Refusal {
    pub fn message(&self) -> &'static str {
        match self {
            Self::DutyLocked => DUTY_REFUSAL,
            Self::Unauthorized => UNAUTHORIZED_REFUSAL,
        }
    }
}

/// Facts about the sender and the agent that the guards decide on.
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub whitelisted: bool,
    pub password_ok: bool,
    pub duty_group: Option<&'a DutyGroup>,
}

impl<'a> GuardContext<'a> {
    pub fn new(
        sender: &str,
        invocation: &Invocation,
        whitelist: &Whitelist,
        command_password: Option<&str>,
        duty_group: Option<&'a DutyGroup>,
    ) -> Self {
        let password_ok = match (command_password, invocation.password_candidate()) {
            (Some(expected), Some(given)) if !expected.is_empty() => {
                constant_time_eq(expected.as_bytes(), given.as_bytes())
            }
            _ => false,
        };
        Self {
            whitelisted: whitelist.contains(sender),
            password_ok,
            duty_group,
        }
    }
}

pub type Guard = fn(&Invocation, &GuardContext<'_>) -> Result<(), Refusal>;

/// Evaluated in order; the first refusal wins.
pub const GUARDS: &[Guard] = &[duty_lock, authorized];

pub fn duty_lock(invocation: &Invocation, ctx: &GuardContext<'_>) -> Result<(), Refusal> {
    let locked = ctx.duty_group.is_some_and(|group| !group.allow_teleport);
    if locked && invocation.is_teleport() {
        return Err(Refusal::DutyLocked);
    }
    Ok(())
}

pub fn authorized(_: &Invocation, ctx: &GuardContext<'_>) -> Result<(), Refusal> {
    if ctx.whitelisted || ctx.password_ok {
        Ok(())
    } else {
        Err(Refusal::Unauthorized)
    }
}

pub fn check(invocation: &Invocation, ctx: &GuardContext<'_>) -> Result<(), Refusal> {
    GUARDS.iter().try_for_each(|guard| guard(invocation, ctx))
}

/// What a dispatched command did.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Spoke(String),
    /// Text that was only logged.
    Suppressed(String),
    Teleport(String),
    Following { target: String, distance: f64 },
    /// The command could not run; the reason was told to the requester.
    Rejected(&'static str),
    Unknown(String),
    Failed(String),
}

/// Gate on public chat for one invocation: server commands always pass,
/// plain text passes once as the reply to the requester.
#[derive(Debug)]
struct ReplyGate {
    reply_pending: bool,
}

impl ReplyGate {
    fn new() -> Self {
        Self {
            reply_pending: true,
        }
    }

    fn permits(&mut self, text: &str) -> bool {
        if text.starts_with('/') {
            return true;
        }
        std::mem::replace(&mut self.reply_pending, false)
    }

    async fn chat(
        &mut self,
        transport: &dyn AgentTransport,
        text: &str,
    ) -> Result<bool, TransportError> {
        if !self.permits(text) {
            tracing::info!(
                target = "agent_fleet::commands",
                agent = %transport.username(),
                text,
                "suppressed public chat"
            );
            return Ok(false);
        }
        transport.chat(text).await?;
        Ok(true)
    }
}

/// Run an already authorized invocation. Transport failures are reported to
/// the requester in chat and returned as [`CommandOutcome::Failed`].
pub async fn dispatch(
    invocation: &Invocation,
    requester: &str,
    ctx: &GuardContext<'_>,
    transport: &dyn AgentTransport,
) -> CommandOutcome {
    let Some(handler) = invocation.spec().and_then(|spec| spec.handler) else {
        return CommandOutcome::Unknown(invocation.name.clone());
    };
    let mut gate = ReplyGate::new();
    let result = match handler {
        CommandName::Say => say(invocation, ctx, transport, &mut gate).await,
        CommandName::TpMe => teleport(transport, format!("/tpahere {requester}")).await,
        CommandName::TpHere => teleport(transport, format!("/tpa {requester}")).await,
        CommandName::Follow => follow(invocation, requester, transport, &mut gate).await,
    };
    match result {
        Ok(outcome) => outcome,
        Err(error) => {
            let message = format!("Command failed: {}", error.message);
            tracing::warn!(
                target = "agent_fleet::commands",
                agent = %transport.username(),
                command = %invocation.name,
                error = %error,
                "command failed"
            );
            if let Err(error) = gate.chat(transport, &message).await {
                tracing::debug!(target = "agent_fleet::commands", error = %error, "could not report failure");
            }
            CommandOutcome::Failed(error.message)
        }
    }
}

async fn say(
    invocation: &Invocation,
    ctx: &GuardContext<'_>,
    transport: &dyn AgentTransport,
    gate: &mut ReplyGate,
) -> Result<CommandOutcome, TransportError> {
    let words = if ctx.whitelisted {
        &invocation.args[..]
    } else {
        // The trailing word was the password.
        &invocation.args[..invocation.args.len().saturating_sub(1)]
    };
    let text = words.join(" ");
    if text.is_empty() {
        return Ok(CommandOutcome::Suppressed(text));
    }
    if gate.chat(transport, &text).await? {
        Ok(CommandOutcome::Spoke(text))
    } else {
        Ok(CommandOutcome::Suppressed(text))
    }
}

async fn teleport(
    transport: &dyn AgentTransport,
    command: String,
) -> Result<CommandOutcome, TransportError> {
    transport.chat(&command).await?;
    Ok(CommandOutcome::Teleport(command))
}

async fn follow(
    invocation: &Invocation,
    requester: &str,
    transport: &dyn AgentTransport,
    gate: &mut ReplyGate,
) -> Result<CommandOutcome, TransportError> {
    let distance = match invocation.args.as_slice() {
        [keyword, value, ..] if keyword.eq_ignore_ascii_case("me") => value
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite() && *d >= 0.0),
        _ => None,
    };
    let Some(distance) = distance else {
        gate.chat(transport, INVALID_DISTANCE).await?;
        return Ok(CommandOutcome::Rejected(INVALID_DISTANCE));
    };

    let target = transport
        .players()
        .into_iter()
        .find(|player| player.username == requester)
        .and_then(|player| player.position);
    let Some(target) = target else {
        gate.chat(transport, NOT_VISIBLE).await?;
        return Ok(CommandOutcome::Rejected(NOT_VISIBLE));
    };

    let goal = Goal::Near {
        x: target.x,
        y: target.y,
        z: target.z,
        range: distance,
    };
    if let Err(error) = transport.set_goal(goal).await {
        tracing::warn!(
            target = "agent_fleet::commands",
            agent = %transport.username(),
            error = %error,
            "failed to set follow goal"
        );
        gate.chat(transport, FOLLOW_FAILED).await?;
        return Ok(CommandOutcome::Rejected(FOLLOW_FAILED));
    }
    Ok(CommandOutcome::Following {
        target: requester.to_string(),
        distance,
    })
}
