//! The engine op vocabulary. Emitted nodes name one of these ops; the flags
//! describe evaluation constraints the generator and the node table rely on
//! (a pure op of identical operands is safe to hash-cons, a side-effecting op
//! must stay in evaluation order, a control-flow op evaluates its operands
//! lazily).

use strum::IntoStaticStr;

macro_rules! ops {
    ($($name:ident => ($side_effects:literal, $pure:literal, $control_flow:literal),)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
        pub enum Op {
            $($name,)*
        }

        impl Op {
            pub fn has_side_effects(self) -> bool {
                match self {
                    $(Op::$name => $side_effects,)*
                }
            }

            pub fn is_pure(self) -> bool {
                match self {
                    $(Op::$name => $pure,)*
                }
            }

            pub fn is_control_flow(self) -> bool {
                match self {
                    $(Op::$name => $control_flow,)*
                }
            }
        }
    };
}

ops! {
    Add => (false, true, false),
    Subtract => (false, true, false),
    Multiply => (false, true, false),
    Divide => (false, true, false),
    Mod => (false, true, false),
    Power => (false, true, false),
    Abs => (false, true, false),
    Sign => (false, true, false),
    Floor => (false, true, false),
    Ceil => (false, true, false),
    Round => (false, true, false),
    Frac => (false, true, false),
    Min => (false, true, false),
    Max => (false, true, false),
    Clamp => (false, true, false),
    Lerp => (false, true, false),
    Sin => (false, true, false),
    Cos => (false, true, false),
    Equal => (false, true, false),
    NotEqual => (false, true, false),
    Greater => (false, true, false),
    GreaterOr => (false, true, false),
    Less => (false, true, false),
    LessOr => (false, true, false),
    Not => (false, true, false),
    And => (false, true, true),
    Or => (false, true, true),
    If => (false, true, true),
    While => (false, true, true),
    Execute => (false, true, true),
    Block => (false, true, true),
    Break => (true, false, true),
    Get => (false, false, false),
    Set => (true, false, false),
    GetShifted => (false, false, false),
    SetShifted => (true, false, false),
    Random => (true, false, false),
    RandomInteger => (true, false, false),
    Spawn => (true, false, false),
    ExportValue => (true, false, false),
    StreamSet => (true, false, false),
    StreamGetValue => (false, false, false),
    DebugLog => (true, false, false),
    Halt => (true, false, true),
}

impl Op {
    /// The name the runtime knows this op by
    pub fn engine_name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_match_op_roles() {
        assert!(Op::Add.is_pure());
        assert!(!Op::Add.has_side_effects());

        assert!(Op::Set.has_side_effects());
        assert!(!Op::Get.is_pure());
        assert!(!Op::Get.has_side_effects());

        assert!(Op::While.is_control_flow());
        assert!(Op::If.is_control_flow());
        assert!(!Op::Random.is_pure());
    }

    #[test]
    fn engine_names_are_pascal_case() {
        assert_eq!(Op::GreaterOr.engine_name(), "GreaterOr");
        assert_eq!(Op::StreamGetValue.engine_name(), "StreamGetValue");
    }
}
