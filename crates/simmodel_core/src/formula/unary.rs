use crate::traits::Scalar;

use super::Formula;

/// One-argument transcendental functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryFunction {
    /// acos(a), derivative -1/sqrt(1 - a^2).
    Acos,
    /// asin(a), derivative 1/sqrt(1 - a^2).
    Asin,
    /// atan(a), derivative 1/(1 + a^2).
    Atan,
    /// cosh(a), derivative sinh(a).
    Cosh,
    /// cos(a), derivative -sin(a).
    Cos,
    /// exp(a), derivative exp(a).
    Exp,
    /// Natural logarithm, derivative 1/a.
    Ln,
    /// log10(a), derivative 1/(a ln 10).
    Log10,
    /// sinh(a), derivative cosh(a).
    Sinh,
    /// sin(a), derivative cos(a).
    Sin,
    /// sqrt(a), derivative 1/(2 sqrt(a)).
    Sqrt,
    /// tanh(a), derivative 1/cosh^2(a).
    Tanh,
    /// tan(a), derivative 1/cos^2(a).
    Tan,
}

impl UnaryFunction {
    pub const ALL: [UnaryFunction; 13] = [
        UnaryFunction::Acos,
        UnaryFunction::Asin,
        UnaryFunction::Atan,
        UnaryFunction::Cosh,
        UnaryFunction::Cos,
        UnaryFunction::Exp,
        UnaryFunction::Ln,
        UnaryFunction::Log10,
        UnaryFunction::Sinh,
        UnaryFunction::Sin,
        UnaryFunction::Sqrt,
        UnaryFunction::Tanh,
        UnaryFunction::Tan,
    ];

    /// Element name in the model document.
    pub fn tag(self) -> &'static str {
        match self {
            UnaryFunction::Acos => "ACOS",
            UnaryFunction::Asin => "ASIN",
            UnaryFunction::Atan => "ATAN",
            UnaryFunction::Cosh => "COSH",
            UnaryFunction::Cos => "COS",
            UnaryFunction::Exp => "EXP",
            UnaryFunction::Ln => "LN",
            UnaryFunction::Log10 => "LOG10",
            UnaryFunction::Sinh => "SINH",
            UnaryFunction::Sin => "SIN",
            UnaryFunction::Sqrt => "SQRT",
            UnaryFunction::Tanh => "TANH",
            UnaryFunction::Tan => "TAN",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag == "LOG" {
            return Some(UnaryFunction::Ln);
        }
        Self::ALL.iter().copied().find(|f| f.tag() == tag)
    }

    pub fn matlab_name(self) -> &'static str {
        match self {
            UnaryFunction::Acos => "acos",
            UnaryFunction::Asin => "asin",
            UnaryFunction::Atan => "atan",
            UnaryFunction::Cosh => "cosh",
            UnaryFunction::Cos => "cos",
            UnaryFunction::Exp => "exp",
            UnaryFunction::Ln => "log",
            UnaryFunction::Log10 => "log10",
            UnaryFunction::Sinh => "sinh",
            UnaryFunction::Sin => "sin",
            UnaryFunction::Sqrt => "sqrt",
            UnaryFunction::Tanh => "tanh",
            UnaryFunction::Tan => "tan",
        }
    }

    pub fn eval<T: Scalar>(self, a: T) -> T {
        match self {
            UnaryFunction::Acos => a.acos(),
            UnaryFunction::Asin => a.asin(),
            UnaryFunction::Atan => a.atan(),
            UnaryFunction::Cosh => a.cosh(),
            UnaryFunction::Cos => a.cos(),
            UnaryFunction::Exp => a.exp(),
            UnaryFunction::Ln => a.ln(),
            UnaryFunction::Log10 => a.log10(),
            UnaryFunction::Sinh => a.sinh(),
            UnaryFunction::Sin => a.sin(),
            UnaryFunction::Sqrt => a.sqrt(),
            UnaryFunction::Tanh => a.tanh(),
            UnaryFunction::Tan => a.tan(),
        }
    }

    /// Closed-form derivative F'(a) used by the chain rule.
    pub fn jacobian_multiplier<T: Scalar>(self, a: T) -> T {
        let one = T::one();
        match self {
            UnaryFunction::Acos => -one / (one - a * a).sqrt(),
            UnaryFunction::Asin => one / (one - a * a).sqrt(),
            UnaryFunction::Atan => one / (one + a * a),
            UnaryFunction::Cosh => a.sinh(),
            UnaryFunction::Cos => -a.sin(),
            UnaryFunction::Exp => a.exp(),
            UnaryFunction::Ln => one / a,
            UnaryFunction::Log10 => one / (a * T::LN_10()),
            UnaryFunction::Sinh => a.cosh(),
            UnaryFunction::Sin => a.cos(),
            UnaryFunction::Sqrt => one / ((one + one) * a.sqrt()),
            UnaryFunction::Tanh => {
                let c = a.cosh();
                one / (c * c)
            }
            UnaryFunction::Tan => {
                let c = a.cos();
                one / (c * c)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryFunctionFormula {
    function: UnaryFunction,
    argument: Box<Formula>,
}

impl UnaryFunctionFormula {
    pub fn new(function: UnaryFunction, argument: Formula) -> Self {
        Self {
            function,
            argument: Box::new(argument),
        }
    }

    pub fn function(&self) -> UnaryFunction {
        self.function
    }

    pub fn argument(&self) -> &Formula {
        &self.argument
    }

    pub fn argument_mut(&mut self) -> &mut Formula {
        &mut self.argument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_points(function: UnaryFunction) -> &'static [f64] {
        match function {
            UnaryFunction::Acos | UnaryFunction::Asin => &[-0.7, -0.2, 0.3, 0.8],
            UnaryFunction::Ln | UnaryFunction::Log10 | UnaryFunction::Sqrt => &[0.2, 1.0, 3.5, 40.0],
            UnaryFunction::Tan => &[-1.2, -0.3, 0.4, 1.1],
            _ => &[-2.0, -0.5, 0.25, 1.5],
        }
    }

    #[test]
    fn values_match_std_functions() {
        let a = 0.4_f64;
        assert_eq!(UnaryFunction::Acos.eval(a), a.acos());
        assert_eq!(UnaryFunction::Asin.eval(a), a.asin());
        assert_eq!(UnaryFunction::Atan.eval(a), a.atan());
        assert_eq!(UnaryFunction::Cosh.eval(a), a.cosh());
        assert_eq!(UnaryFunction::Cos.eval(a), a.cos());
        assert_eq!(UnaryFunction::Exp.eval(a), a.exp());
        assert_eq!(UnaryFunction::Ln.eval(a), a.ln());
        assert_eq!(UnaryFunction::Log10.eval(a), a.log10());
        assert_eq!(UnaryFunction::Sinh.eval(a), a.sinh());
        assert_eq!(UnaryFunction::Sin.eval(a), a.sin());
        assert_eq!(UnaryFunction::Sqrt.eval(a), a.sqrt());
        assert_eq!(UnaryFunction::Tanh.eval(a), a.tanh());
        assert_eq!(UnaryFunction::Tan.eval(a), a.tan());
    }

    #[test]
    fn jacobian_multipliers_match_central_differences() {
        let h = 1e-6;
        for function in UnaryFunction::ALL {
            for &a in sample_points(function) {
                let numeric = (function.eval(a + h) - function.eval(a - h)) / (2.0 * h);
                let analytic = function.jacobian_multiplier(a);
                assert_relative_eq!(analytic, numeric, epsilon = 1e-7, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn multipliers_are_generic_over_float_type() {
        let analytic = UnaryFunction::Log10.jacobian_multiplier(2.0_f32);
        assert!((analytic - 1.0 / (2.0 * std::f32::consts::LN_10)).abs() < 1e-6);
    }

    #[test]
    fn tags_round_trip_and_log_aliases_ln() {
        for function in UnaryFunction::ALL {
            assert_eq!(UnaryFunction::from_tag(function.tag()), Some(function));
        }
        assert_eq!(UnaryFunction::from_tag("LOG"), Some(UnaryFunction::Ln));
        assert_eq!(UnaryFunction::from_tag("ABS"), None);
        assert_eq!(UnaryFunction::Ln.matlab_name(), "log");
    }
}
