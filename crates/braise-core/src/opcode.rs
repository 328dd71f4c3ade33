//! opcode.rs — jeu d'instructions à un octet de la VM Braise.
//!
//! Chaque variante correspond à un octet d'opcode suivi, le cas échéant,
//! d'opérandes de largeur fixe (voir `operand_len`). `Chunk::code` reste un
//! `Vec<u8>` brut — l'enum sert uniquement au décodage et à l'assemblage,
//! jamais à la représentation stockée, pour que l'invariant "un octet émis
//! == une entrée de la table des lignes" porte sur des octets réels et non
//! sur des variantes d'enum.
//!
//! ⚠️ Compat : l'ordre des variantes n'a pas d'importance ici (on ne
//! sérialise pas l'enum lui-même), mais la valeur de chaque octet est fixée
//! une fois choisie : ne pas la réutiliser pour un autre opcode.

/// Un opcode décodé, sans ses opérandes (qui restent dans `Chunk::code`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Constant = 0,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl OpCode {
    /// Nombre d'octets d'opérande suivant l'opcode (sans compter l'opcode
    /// lui-même). `Closure` est variable (dépend de `upvalue_count`) et est
    /// géré à part par le compilateur/la VM.
    pub const fn operand_len(self) -> usize {
        use OpCode::*;
        match self {
            Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty
            | GetSuper | Class | Method => 1,
            GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => 1,
            Invoke | SuperInvoke => 2,
            Jump | JumpIfFalse | Loop => 2,
            Closure => 1, // + 2 octets par upvalue, décodés séparément
            Nil | True | False | Pop | Equal | Greater | Less | Add | Subtract | Multiply
            | Divide | Not | Negate | Print | CloseUpvalue | Return | Inherit => 0,
        }
    }

    /// Décode un octet brut en opcode. `None` si la valeur ne correspond à
    /// aucune variante connue (bytecode corrompu ou mal formé).
    pub const fn from_byte(byte: u8) -> Option<Self> {
        use OpCode::*;
        Some(match byte {
            0 => Constant,
            1 => Nil,
            2 => True,
            3 => False,
            4 => Pop,
            5 => GetLocal,
            6 => SetLocal,
            7 => GetGlobal,
            8 => DefineGlobal,
            9 => SetGlobal,
            10 => GetUpvalue,
            11 => SetUpvalue,
            12 => GetProperty,
            13 => SetProperty,
            14 => GetSuper,
            15 => Equal,
            16 => Greater,
            17 => Less,
            18 => Add,
            19 => Subtract,
            20 => Multiply,
            21 => Divide,
            22 => Not,
            23 => Negate,
            24 => Print,
            25 => Jump,
            26 => JumpIfFalse,
            27 => Loop,
            28 => Call,
            29 => Invoke,
            30 => SuperInvoke,
            31 => Closure,
            32 => CloseUpvalue,
            33 => Return,
            34 => Class,
            35 => Inherit,
            36 => Method,
            _ => return None,
        })
    }

    /// Mnémonique court, pour le désassembleur.
    pub const fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Constant => "OP_CONSTANT",
            Nil => "OP_NIL",
            True => "OP_TRUE",
            False => "OP_FALSE",
            Pop => "OP_POP",
            GetLocal => "OP_GET_LOCAL",
            SetLocal => "OP_SET_LOCAL",
            GetGlobal => "OP_GET_GLOBAL",
            DefineGlobal => "OP_DEFINE_GLOBAL",
            SetGlobal => "OP_SET_GLOBAL",
            GetUpvalue => "OP_GET_UPVALUE",
            SetUpvalue => "OP_SET_UPVALUE",
            GetProperty => "OP_GET_PROPERTY",
            SetProperty => "OP_SET_PROPERTY",
            GetSuper => "OP_GET_SUPER",
            Equal => "OP_EQUAL",
            Greater => "OP_GREATER",
            Less => "OP_LESS",
            Add => "OP_ADD",
            Subtract => "OP_SUBTRACT",
            Multiply => "OP_MULTIPLY",
            Divide => "OP_DIVIDE",
            Not => "OP_NOT",
            Negate => "OP_NEGATE",
            Print => "OP_PRINT",
            Jump => "OP_JUMP",
            JumpIfFalse => "OP_JUMP_IF_FALSE",
            Loop => "OP_LOOP",
            Call => "OP_CALL",
            Invoke => "OP_INVOKE",
            SuperInvoke => "OP_SUPER_INVOKE",
            Closure => "OP_CLOSURE",
            CloseUpvalue => "OP_CLOSE_UPVALUE",
            Return => "OP_RETURN",
            Class => "OP_CLASS",
            Inherit => "OP_INHERIT",
            Method => "OP_METHOD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_roundtrip() {
        for byte in 0..=36u8 {
            let op = OpCode::from_byte(byte).expect("defined opcode");
            assert_eq!(op as u8, byte);
        }
        assert!(OpCode::from_byte(37).is_none());
    }

    #[test]
    fn operand_lens_are_correct() {
        assert_eq!(OpCode::Jump.operand_len(), 2);
        assert_eq!(OpCode::Invoke.operand_len(), 2);
        assert_eq!(OpCode::GetLocal.operand_len(), 1);
        assert_eq!(OpCode::Return.operand_len(), 0);
    }
}
