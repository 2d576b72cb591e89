use serde::{Deserialize, Serialize};

/// Which of the two fixed identities is speaking. Doubles as the `currentTurn` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PersonaId {
    #[default]
    A,
    B,
}

impl PersonaId {
    pub fn other(self) -> Self {
        match self {
            PersonaId::A => PersonaId::B,
            PersonaId::B => PersonaId::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PersonaId::A => "A",
            PersonaId::B => "B",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Some(PersonaId::A),
            "B" => Some(PersonaId::B),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: PersonaId,
    pub name: String,
    pub instructions: String,
    pub style: String,
}

/// Both personas, loaded once at startup.
#[derive(Debug, Clone)]
pub struct PersonaPair {
    pub a: Persona,
    pub b: Persona,
}

impl PersonaPair {
    pub fn new(a: Persona, b: Persona) -> Self {
        Self { a, b }
    }

    pub fn get(&self, id: PersonaId) -> &Persona {
        match id {
            PersonaId::A => &self.a,
            PersonaId::B => &self.b,
        }
    }

    /// Resolve a persona from either its id ("A"/"B") or its display name.
    pub fn find(&self, key: &str) -> Option<&Persona> {
        if let Some(id) = PersonaId::parse(key) {
            return Some(self.get(id));
        }
        [&self.a, &self.b]
            .into_iter()
            .find(|persona| persona.name.eq_ignore_ascii_case(key.trim()))
    }
}
