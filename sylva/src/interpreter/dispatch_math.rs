//! Base and extended math opcodes. All arithmetic works on immediates; a
//! node is only allocated when the caller needs one.

use crate::node::{NodeId, NodeKind};
use crate::value::EvalResult;

use super::Interpreter;

impl Interpreter {
    /// n-ary `+ - * / mod`. A single operand negates (or reciprocates) per
    /// the usual conventions; null operands poison the fold to NaN.
    pub(crate) fn op_arithmetic(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = match kind {
            NodeKind::Add => {
                let mut acc = 0.0;
                for &child in &children {
                    acc += self.interpret_into_number(Some(child));
                }
                acc
            }
            NodeKind::Multiply => {
                let mut acc = 1.0;
                for &child in &children {
                    acc *= self.interpret_into_number(Some(child));
                }
                acc
            }
            NodeKind::Subtract => match children.split_first() {
                None => f64::NAN,
                Some((&first, [])) => -self.interpret_into_number(Some(first)),
                Some((&first, rest)) => {
                    let mut acc = self.interpret_into_number(Some(first));
                    for &child in rest {
                        acc -= self.interpret_into_number(Some(child));
                    }
                    acc
                }
            },
            NodeKind::Divide => match children.split_first() {
                None => f64::NAN,
                Some((&first, [])) => 1.0 / self.interpret_into_number(Some(first)),
                Some((&first, rest)) => {
                    let mut acc = self.interpret_into_number(Some(first));
                    for &child in rest {
                        acc /= self.interpret_into_number(Some(child));
                    }
                    acc
                }
            },
            NodeKind::Modulus => match children.split_first() {
                None => f64::NAN,
                Some((&first, rest)) => {
                    let mut acc = self.interpret_into_number(Some(first));
                    for &child in rest {
                        let divisor = self.interpret_into_number(Some(child));
                        acc %= divisor;
                    }
                    acc
                }
            },
            _ => f64::NAN,
        };
        self.number_result(value, immediate_ok)
    }

    /// `(floor x)`, `(ceil x)`, `(round x digits?)`.
    pub(crate) fn op_rounding(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret_into_number(children.first().copied());
        let result = match kind {
            NodeKind::Floor => value.floor(),
            NodeKind::Ceiling => value.ceil(),
            NodeKind::Round => {
                let digits = children
                    .get(1)
                    .map(|&c| self.interpret_into_number(Some(c)))
                    .filter(|d| !d.is_nan());
                match digits {
                    Some(d) => {
                        let scale = 10f64.powi(d as i32);
                        (value * scale).round() / scale
                    }
                    None => value.round(),
                }
            }
            _ => f64::NAN,
        };
        self.number_result(result, immediate_ok)
    }

    pub(crate) fn op_unary_math(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let x = self.interpret_into_number(children.first().copied());
        let value = match kind {
            NodeKind::Exponent => x.exp(),
            NodeKind::Log => {
                // Optional base as the second operand.
                match children.get(1) {
                    Some(&base) => {
                        let b = self.interpret_into_number(Some(base));
                        x.log(b)
                    }
                    None => x.ln(),
                }
            }
            NodeKind::Sin => x.sin(),
            NodeKind::Asin => x.asin(),
            NodeKind::Cos => x.cos(),
            NodeKind::Acos => x.acos(),
            NodeKind::Tan => x.tan(),
            NodeKind::Atan => match children.get(1) {
                Some(&other) => {
                    let y = self.interpret_into_number(Some(other));
                    x.atan2(y)
                }
                None => x.atan(),
            },
            NodeKind::Sinh => x.sinh(),
            NodeKind::Asinh => x.asinh(),
            NodeKind::Cosh => x.cosh(),
            NodeKind::Acosh => x.acosh(),
            NodeKind::Tanh => x.tanh(),
            NodeKind::Atanh => x.atanh(),
            NodeKind::Erf => erf(x),
            NodeKind::Tgamma => tgamma(x),
            NodeKind::Lgamma => tgamma(x).abs().ln(),
            NodeKind::Sqrt => x.sqrt(),
            NodeKind::Abs => x.abs(),
            _ => f64::NAN,
        };
        self.number_result(value, immediate_ok)
    }

    pub(crate) fn op_pow(&mut self, n: NodeId, immediate_ok: bool) -> EvalResult {
        let children = self.manager.children_of(n);
        let base = self.interpret_into_number(children.first().copied());
        let exponent = self.interpret_into_number(children.get(1).copied());
        self.number_result(base.powf(exponent), immediate_ok)
    }

    /// `(max ...)` / `(min ...)` over numeric operands; NaN operands are
    /// skipped so a single bad value does not absorb the fold.
    pub(crate) fn op_max_min(
        &mut self,
        n: NodeId,
        kind: NodeKind,
        immediate_ok: bool,
    ) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut best = f64::NAN;
        for &child in &children {
            let v = self.interpret_into_number(Some(child));
            if v.is_nan() {
                continue;
            }
            if best.is_nan()
                || (kind == NodeKind::Max && v > best)
                || (kind == NodeKind::Min && v < best)
            {
                best = v;
            }
        }
        self.number_result(best, immediate_ok)
    }

    /// `(dot_product a b)` — over two lists, or two assocs matched by key.
    pub(crate) fn op_dot_product(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let a = self.interpret(children.first().copied(), false);
        self.protect(&a);
        let b = self.interpret(children.get(1).copied(), false);
        self.protect(&b);

        let value = match (a.node_id(), b.node_id()) {
            (Some(x), Some(y))
                if self.manager.kind_of(x) == NodeKind::Assoc
                    && self.manager.kind_of(y) == NodeKind::Assoc =>
            {
                let mut sum = 0.0;
                for (key, va) in self.manager.mapped_entries(x) {
                    if let Some(vb) = self.manager.mapped_get(y, key) {
                        sum += self.node_to_number(va) * self.node_to_number(vb);
                    }
                }
                sum
            }
            (Some(x), Some(y)) => {
                let ca = self.manager.children_of(x);
                let cb = self.manager.children_of(y);
                ca.iter()
                    .zip(&cb)
                    .map(|(&va, &vb)| self.node_to_number(va) * self.node_to_number(vb))
                    .sum()
            }
            _ => f64::NAN,
        };
        self.unprotect(&b);
        self.unprotect(&a);
        self.free_result(b);
        self.free_result(a);
        EvalResult::number(value)
    }

    /// `(generalized_distance p a b weights?)` — Minkowski distance of
    /// order `p` between two numeric vectors; `p` of infinity takes the
    /// maximum coordinate difference.
    pub(crate) fn op_generalized_distance(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let p = self.interpret_into_number(children.first().copied());
        let a = self.numeric_vector(children.get(1).copied());
        let b = self.numeric_vector(children.get(2).copied());
        let weights = children
            .get(3)
            .map(|&w| self.numeric_vector(Some(w)))
            .unwrap_or_default();

        let len = a.len().min(b.len());
        if len == 0 {
            return EvalResult::number(f64::NAN);
        }
        let weight = |i: usize| weights.get(i).copied().unwrap_or(1.0);
        let value = if p == f64::INFINITY {
            (0..len)
                .map(|i| (a[i] - b[i]).abs() * weight(i))
                .fold(0.0, f64::max)
        } else if p <= 0.0 || p.is_nan() {
            f64::NAN
        } else {
            let sum: f64 = (0..len)
                .map(|i| (a[i] - b[i]).abs().powf(p) * weight(i))
                .sum();
            sum.powf(1.0 / p)
        };
        EvalResult::number(value)
    }

    /// `(entropy distribution)` — Shannon entropy in nats of a list or
    /// assoc of probabilities (normalized first).
    pub(crate) fn op_entropy(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let mut values = self.numeric_vector(children.first().copied());
        values.retain(|v| *v > 0.0 && !v.is_nan());
        let total: f64 = values.iter().sum();
        if total <= 0.0 {
            return EvalResult::number(0.0);
        }
        let entropy = -values
            .iter()
            .map(|v| {
                let p = v / total;
                p * p.ln()
            })
            .sum::<f64>();
        EvalResult::number(entropy)
    }

    /// `(get_digits value base? first? last?)` — digits of a number, most
    /// significant first.
    pub(crate) fn op_get_digits(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret_into_number(children.first().copied());
        let base = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|b| *b >= 2.0 && !b.is_nan())
            .unwrap_or(10.0);
        if value.is_nan() || value.is_infinite() {
            return EvalResult::NULL;
        }
        let digits = digits_of(value.abs(), base);
        let out = self.manager.alloc(NodeKind::List);
        for d in digits {
            let node = self.manager.alloc_number(d);
            self.manager.push_child(out, node);
        }
        EvalResult::node(out, true)
    }

    /// `(set_digits value base digits-list)` — reassembles a number from
    /// digit values.
    pub(crate) fn op_set_digits(&mut self, n: NodeId) -> EvalResult {
        let children = self.manager.children_of(n);
        let value = self.interpret_into_number(children.first().copied());
        let base = children
            .get(1)
            .map(|&c| self.interpret_into_number(Some(c)))
            .filter(|b| *b >= 2.0 && !b.is_nan())
            .unwrap_or(10.0);
        let digits = self.numeric_vector(children.get(2).copied());
        if digits.is_empty() {
            return EvalResult::number(value);
        }
        let mut result = 0.0;
        for &d in &digits {
            result = result * base + d;
        }
        if value < 0.0 {
            result = -result;
        }
        EvalResult::number(result)
    }

    /// Evaluates a node into a vector of numbers (list elements or assoc
    /// values in key order).
    pub(crate) fn numeric_vector(&mut self, node: Option<NodeId>) -> Vec<f64> {
        let result = self.interpret(node, false);
        let values = match result.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::Assoc => self
                .manager
                .mapped_entries_sorted(id)
                .into_iter()
                .map(|(_, v)| self.node_to_number(v))
                .collect(),
            Some(id) if self.manager.kind_of(id) == NodeKind::List => self
                .manager
                .children_of(id)
                .into_iter()
                .map(|v| self.node_to_number(v))
                .collect(),
            _ => {
                let v = self.value_to_number(&result);
                if v.is_nan() {
                    Vec::new()
                } else {
                    vec![v]
                }
            }
        };
        self.free_result(result);
        values
    }
}

/// Integer digits of `value` in `base`, most significant first; the
/// fractional part is dropped.
fn digits_of(value: f64, base: f64) -> Vec<f64> {
    let mut whole = value.trunc();
    if whole == 0.0 {
        return vec![0.0];
    }
    let mut digits = Vec::new();
    while whole > 0.0 {
        digits.push(whole % base);
        whole = (whole / base).trunc();
    }
    digits.reverse();
    digits
}

/// Abramowitz & Stegun 7.1.26 rational approximation, good to ~1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let y = 1.0
        - (((((1.061405429 * t - 1.453152027) * t) + 1.421413741) * t - 0.284496736) * t
            + 0.254829592)
            * t
            * (-x * x).exp();
    sign * y
}

/// Lanczos approximation of the gamma function.
fn tgamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEFFS: [f64; 9] = [
        0.99999999999980993,
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        // Reflection formula.
        std::f64::consts::PI / ((std::f64::consts::PI * x).sin() * tgamma(1.0 - x))
    } else {
        let x = x - 1.0;
        let mut acc = COEFFS[0];
        for (i, &c) in COEFFS.iter().enumerate().skip(1) {
            acc += c / (x + i as f64);
        }
        let t = x + G + 0.5;
        (2.0 * std::f64::consts::PI).sqrt() * t.powf(x + 0.5) * (-t).exp() * acc
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{digits_of, erf, tgamma};

    #[test]
    fn erf_reference_points() {
        assert!((erf(0.0)).abs() < 1e-7);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-1.0) + 0.8427007929).abs() < 1e-6);
    }

    #[test]
    fn tgamma_matches_factorials() {
        for (x, expected) in [(1.0, 1.0), (2.0, 1.0), (3.0, 2.0), (5.0, 24.0)] {
            assert!(
                (tgamma(x) - expected).abs() < 1e-9 * expected.max(1.0),
                "gamma({}) = {}",
                x,
                tgamma(x)
            );
        }
    }

    #[test]
    fn digit_extraction() {
        assert_eq!(digits_of(123.0, 10.0), vec![1.0, 2.0, 3.0]);
        assert_eq!(digits_of(5.0, 2.0), vec![1.0, 0.0, 1.0]);
        assert_eq!(digits_of(0.0, 10.0), vec![0.0]);
    }
}
