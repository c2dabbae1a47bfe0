use std::collections::HashMap;

use super::protocol::{TunerReply, TunerRequest, TunerStatus};
use super::{ConfigAction, ConfigName, ConfigSetting, NotifySettingsFn};
use crate::error::AfeResult;
use crate::frontend::AfeContext;

/// What a command handler can reach.
pub struct TunerContext<'a> {
    pub afe: &'a AfeContext,
    notify: &'a mut NotifySettingsFn,
}

impl<'a> TunerContext<'a> {
    pub(crate) fn new(afe: &'a AfeContext, notify: &'a mut NotifySettingsFn) -> Self {
        Self { afe, notify }
    }

    /// Hands a setting to the application and returns the value it left.
    pub fn notify(&mut self, action: ConfigAction, name: ConfigName, value: i32) -> AfeResult<i32> {
        let mut setting = ConfigSetting {
            action,
            name,
            value,
        };
        (self.notify)(self.afe, &mut setting)?;
        Ok(setting.value)
    }
}

pub trait TunerCommand: Send + Sync {
    fn verb(&self) -> &str;
    /// `None` matches any name, which is then passed on as the first
    /// argument.
    fn name(&self) -> Option<&str>;
    fn min_args(&self) -> usize;
    fn execute(&self, ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply;

    fn describe(&self) -> String {
        match self.name() {
            Some(name) => format!("{},{}", self.verb(), name),
            None => self.verb().to_string(),
        }
    }
}

pub type HandlerFn = fn(&mut TunerContext<'_>, &TunerRequest) -> TunerReply;

/// A command backed by a plain function.
pub struct FnCommand {
    verb: &'static str,
    name: Option<&'static str>,
    min_args: usize,
    handler: HandlerFn,
}

impl FnCommand {
    pub const fn new(
        verb: &'static str,
        name: Option<&'static str>,
        min_args: usize,
        handler: HandlerFn,
    ) -> Self {
        Self {
            verb,
            name,
            min_args,
            handler,
        }
    }
}

impl TunerCommand for FnCommand {
    fn verb(&self) -> &str {
        self.verb
    }

    fn name(&self) -> Option<&str> {
        self.name
    }

    fn min_args(&self) -> usize {
        self.min_args
    }

    fn execute(&self, ctx: &mut TunerContext<'_>, req: &TunerRequest) -> TunerReply {
        (self.handler)(ctx, req)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CommandKey {
    verb: String,
    name: Option<String>,
}

pub struct CommandRegistry {
    commands: HashMap<CommandKey, Box<dyn TunerCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn register(&mut self, command: Box<dyn TunerCommand>) {
        let key = CommandKey {
            verb: command.verb().to_string(),
            name: command.name().map(str::to_string),
        };
        if self.commands.insert(key, command).is_some() {
            log::warn!("Tuner command registered twice, last one wins");
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Exact verb and name first, then verb alone.
    fn lookup(&self, req: TunerRequest) -> Option<(&dyn TunerCommand, TunerRequest)> {
        let exact = CommandKey {
            verb: req.verb.clone(),
            name: req.name.clone(),
        };
        if req.name.is_some() {
            if let Some(cmd) = self.commands.get(&exact) {
                return Some((cmd.as_ref(), req));
            }
        }
        let verb_only = CommandKey {
            verb: req.verb.clone(),
            name: None,
        };
        self.commands
            .get(&verb_only)
            .map(|cmd| (cmd.as_ref(), req.into_verb_only()))
    }

    /// Parses one request line and runs the matching command.
    pub fn dispatch(&self, ctx: &mut TunerContext<'_>, line: &str) -> TunerReply {
        let req = match TunerRequest::parse(line) {
            Ok(req) => req,
            Err(e) => return TunerReply::from_error(&e),
        };
        let Some((cmd, req)) = self.lookup(req) else {
            log::warn!("Unknown tuner command: {}", line);
            return TunerReply::status(TunerStatus::InvalidCmd);
        };
        if req.args.len() < cmd.min_args() {
            log::warn!("Tuner command {} is missing arguments", cmd.describe());
            return TunerReply::status(TunerStatus::InvalidCmdParams);
        }
        cmd.execute(ctx, &req)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}
