use crate::error::GatewayError;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Bitmask of the event groups the gateway should deliver, sent with IDENTIFY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Intents(u32);

const NAMED: [(&str, Intents); 15] = [
    ("GUILDS", Intents::GUILDS),
    ("GUILD_MEMBERS", Intents::GUILD_MEMBERS),
    ("GUILD_BANS", Intents::GUILD_BANS),
    ("GUILD_EMOJIS_AND_STICKERS", Intents::GUILD_EMOJIS_AND_STICKERS),
    ("GUILD_INTEGRATIONS", Intents::GUILD_INTEGRATIONS),
    ("GUILD_WEBHOOKS", Intents::GUILD_WEBHOOKS),
    ("GUILD_INVITES", Intents::GUILD_INVITES),
    ("GUILD_VOICE_STATES", Intents::GUILD_VOICE_STATES),
    ("GUILD_PRESENCES", Intents::GUILD_PRESENCES),
    ("GUILD_MESSAGES", Intents::GUILD_MESSAGES),
    ("GUILD_MESSAGE_REACTIONS", Intents::GUILD_MESSAGE_REACTIONS),
    ("GUILD_MESSAGE_TYPING", Intents::GUILD_MESSAGE_TYPING),
    ("DIRECT_MESSAGES", Intents::DIRECT_MESSAGES),
    ("DIRECT_MESSAGE_REACTIONS", Intents::DIRECT_MESSAGE_REACTIONS),
    ("DIRECT_MESSAGE_TYPING", Intents::DIRECT_MESSAGE_TYPING),
];

impl Intents {
    pub const GUILDS: Intents = Intents(1 << 0);
    pub const GUILD_MEMBERS: Intents = Intents(1 << 1);
    pub const GUILD_BANS: Intents = Intents(1 << 2);
    pub const GUILD_EMOJIS_AND_STICKERS: Intents = Intents(1 << 3);
    pub const GUILD_INTEGRATIONS: Intents = Intents(1 << 4);
    pub const GUILD_WEBHOOKS: Intents = Intents(1 << 5);
    pub const GUILD_INVITES: Intents = Intents(1 << 6);
    pub const GUILD_VOICE_STATES: Intents = Intents(1 << 7);
    pub const GUILD_PRESENCES: Intents = Intents(1 << 8);
    pub const GUILD_MESSAGES: Intents = Intents(1 << 9);
    pub const GUILD_MESSAGE_REACTIONS: Intents = Intents(1 << 10);
    pub const GUILD_MESSAGE_TYPING: Intents = Intents(1 << 11);
    pub const DIRECT_MESSAGES: Intents = Intents(1 << 12);
    pub const DIRECT_MESSAGE_REACTIONS: Intents = Intents(1 << 13);
    pub const DIRECT_MESSAGE_TYPING: Intents = Intents(1 << 14);

    pub const fn empty() -> Self {
        Intents(0)
    }

    pub fn all() -> Self {
        NAMED.iter().fold(Intents::empty(), |acc, (_, flag)| acc | *flag)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Intents) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combines flags given by name, e.g. `["GUILDS", "GUILD_MESSAGES"]`.
    pub fn from_names<I, S>(names: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .try_fold(Intents::empty(), |acc, name| Ok(acc | name.as_ref().parse::<Intents>()?))
    }
}

impl BitOr for Intents {
    type Output = Intents;

    fn bitor(self, rhs: Intents) -> Intents {
        Intents(self.0 | rhs.0)
    }
}

impl BitOrAssign for Intents {
    fn bitor_assign(&mut self, rhs: Intents) {
        self.0 |= rhs.0;
    }
}

impl FromStr for Intents {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        NAMED
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, flag)| *flag)
            .ok_or_else(|| GatewayError::Config(format!("unknown intent '{s}'")))
    }
}

impl fmt::Display for Intents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = NAMED
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        write!(f, "{}", names.join(" | "))
    }
}
