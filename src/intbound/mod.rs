//! Integer bounds: an interval combined with tristate known bits
//!
//! An [`IntBound`] describes the set of 64-bit integers a value may take:
//! every member lies in `lower..=upper` and agrees with `tvalue` on every
//! bit that is clear in `tmask`. The two halves of the domain refine each
//! other; every constructor and mutator leaves the bound *shrunk*, that is
//! the interval ends are members and the known bits include the common
//! prefix of the interval ends.
//!
//! Mutators return whether anything changed, and fail with
//! [`Error::InvalidLoop`] when the bound would become empty.

use crate::error::{Error, Result};
use crate::info::Nullness;
use crate::ir::{Const, Op, OpCode, OpRef, Operand, Type};
use std::fmt;

pub const MININT: i64 = i64::MIN;
pub const MAXINT: i64 = i64::MAX;

const MSB: u64 = 1 << 63;

/// Mask of the bits above the highest set bit of `x`
fn leading_zeros_mask(x: u64) -> u64 {
    if x == 0 {
        u64::MAX
    } else {
        !(u64::MAX >> x.leading_zeros())
    }
}

/// Smallest number with all bits set up to the highest set bit of `x`
fn next_pow2_m1(x: u64) -> u64 {
    !leading_zeros_mask(x)
}

/// Smallest unsigned `u >= threshold` agreeing with `value` outside `mask`
fn min_unsigned_atleast(threshold: u64, value: u64, mask: u64) -> Option<u64> {
    let diff = (threshold ^ value) & !mask;
    if diff == 0 {
        return Some(threshold);
    }
    let h = 63 - diff.leading_zeros();
    let hbit = 1u64 << h;
    let below = hbit - 1;
    if value & hbit != 0 {
        // threshold has a zero where a one is required: raise that bit
        let above = !(below | hbit);
        Some((threshold & above) | hbit | (value & below))
    } else {
        // carry into the lowest free zero bit above h
        let candidates = mask & !threshold & !(below | hbit);
        if candidates == 0 {
            return None;
        }
        let jbit = 1u64 << candidates.trailing_zeros();
        let above_j = !((jbit << 1).wrapping_sub(1));
        Some((threshold & above_j) | jbit | (value & (jbit - 1)))
    }
}

/// Largest unsigned `u <= threshold` agreeing with `value` outside `mask`
fn max_unsigned_atmost(threshold: u64, value: u64, mask: u64) -> Option<u64> {
    min_unsigned_atleast(!threshold, !value & !mask, mask).map(|u| !u)
}

// ========== Tristate numbers ==========

fn tnum_add(tv1: u64, tm1: u64, tv2: u64, tm2: u64) -> (u64, u64) {
    let sum_values = tv1.wrapping_add(tv2);
    let sum_masks = tm1.wrapping_add(tm2);
    let all_carries = sum_values.wrapping_add(sum_masks);
    let val_carries = all_carries ^ sum_values;
    let tmask = tm1 | tm2 | val_carries;
    (sum_values & !tmask, tmask)
}

fn tnum_sub(tv1: u64, tm1: u64, tv2: u64, tm2: u64) -> (u64, u64) {
    let diff = tv1.wrapping_sub(tv2);
    let borrows = diff.wrapping_add(tm1) ^ diff.wrapping_sub(tm2);
    let tmask = tm1 | tm2 | borrows;
    (diff & !tmask, tmask)
}

fn tnum_and(tv1: u64, tm1: u64, tv2: u64, tm2: u64) -> (u64, u64) {
    let tvalue = tv1 & tv2;
    let tmask = (tv1 | tm1) & (tv2 | tm2) & !tvalue;
    (tvalue, tmask)
}

fn tnum_or(tv1: u64, tm1: u64, tv2: u64, tm2: u64) -> (u64, u64) {
    let tvalue = tv1 | tv2;
    (tvalue, (tm1 | tm2) & !tvalue)
}

fn tnum_xor(tv1: u64, tm1: u64, tv2: u64, tm2: u64) -> (u64, u64) {
    let tmask = tm1 | tm2;
    ((tv1 ^ tv2) & !tmask, tmask)
}

/// Intersection of two tristate numbers, `None` if they disagree on a known bit
fn tnum_intersect(tv1: u64, tm1: u64, tv2: u64, tm2: u64) -> Option<(u64, u64)> {
    let both_known = !(tm1 | tm2);
    if (tv1 ^ tv2) & both_known != 0 {
        return None;
    }
    let tmask = tm1 & tm2;
    Some(((tv1 | tv2) & !tmask, tmask))
}

/// Abstract value of an integer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntBound {
    pub lower: i64,
    pub upper: i64,
    /// Values of the known bits
    pub tvalue: u64,
    /// Unknown bits
    pub tmask: u64,
}

impl Default for IntBound {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl IntBound {
    /// Any integer
    pub fn unbounded() -> Self {
        IntBound {
            lower: MININT,
            upper: MAXINT,
            tvalue: 0,
            tmask: u64::MAX,
        }
    }

    pub fn from_constant(value: i64) -> Self {
        IntBound {
            lower: value,
            upper: value,
            tvalue: value as u64,
            tmask: 0,
        }
    }

    /// Bound with the given interval
    pub fn new(lower: i64, upper: i64) -> Result<Self> {
        Self::new_full(lower, upper, 0, u64::MAX)
    }

    /// Bound with an interval and known bits
    pub fn new_full(lower: i64, upper: i64, tvalue: u64, tmask: u64) -> Result<Self> {
        if lower > upper {
            return Err(Error::invalid_loop(format!(
                "empty integer range {}..={}",
                lower, upper
            )));
        }
        let mut bound = IntBound {
            lower,
            upper,
            tvalue: tvalue & !tmask,
            tmask,
        };
        bound.shrink()?;
        Ok(bound)
    }

    /// Bound described by known bits only
    pub fn from_knownbits(tvalue: u64, tmask: u64) -> Self {
        Self::new_full(MININT, MAXINT, tvalue, tmask).unwrap_or_else(|_| Self::unbounded())
    }

    pub fn nonnegative() -> Self {
        IntBound {
            lower: 0,
            upper: MAXINT,
            tvalue: 0,
            tmask: !MSB,
        }
    }

    /// `0..=1`
    pub fn boolean() -> Self {
        IntBound {
            lower: 0,
            upper: 1,
            tvalue: 0,
            tmask: 1,
        }
    }

    /// Result of a transfer function; falls back to no information if the
    /// parts contradict each other
    fn from_parts(lower: i64, upper: i64, tvalue: u64, tmask: u64) -> Self {
        Self::new_full(lower, upper, tvalue, tmask).unwrap_or_else(|_| Self::unbounded())
    }

    // ========== Shrinking ==========

    fn min_by_knownbits_atleast(&self, threshold: i64) -> Option<i64> {
        let value = self.tvalue ^ (MSB & !self.tmask);
        min_unsigned_atleast(threshold as u64 ^ MSB, value, self.tmask).map(|u| (u ^ MSB) as i64)
    }

    fn max_by_knownbits_atmost(&self, threshold: i64) -> Option<i64> {
        let value = self.tvalue ^ (MSB & !self.tmask);
        max_unsigned_atmost(threshold as u64 ^ MSB, value, self.tmask).map(|u| (u ^ MSB) as i64)
    }

    fn shrink_bounds_by_knownbits(&mut self) -> Result<bool> {
        let lower = self.min_by_knownbits_atleast(self.lower);
        let upper = self.max_by_knownbits_atmost(self.upper);
        match (lower, upper) {
            (Some(lower), Some(upper)) if lower <= upper => {
                let changed = lower != self.lower || upper != self.upper;
                self.lower = lower;
                self.upper = upper;
                Ok(changed)
            }
            _ => Err(Error::invalid_loop(format!(
                "no value of {} matches its known bits",
                self
            ))),
        }
    }

    fn shrink_knownbits_by_bounds(&mut self) -> Result<bool> {
        let hbm = leading_zeros_mask((self.lower ^ self.upper) as u64);
        let common = self.lower as u64 & hbm;
        let (tvalue, tmask) = tnum_intersect(self.tvalue, self.tmask, common, !hbm)
            .ok_or_else(|| Error::invalid_loop(format!("known bits of {} contradict its range", self)))?;
        let changed = tvalue != self.tvalue || tmask != self.tmask;
        self.tvalue = tvalue;
        self.tmask = tmask;
        Ok(changed)
    }

    fn shrink(&mut self) -> Result<()> {
        loop {
            let mut changed = self.shrink_bounds_by_knownbits()?;
            changed |= self.shrink_knownbits_by_bounds()?;
            if !changed {
                return Ok(());
            }
        }
    }

    // ========== Queries ==========

    pub fn is_constant(&self) -> bool {
        self.lower == self.upper
    }

    pub fn get_constant(&self) -> Option<i64> {
        self.is_constant().then_some(self.lower)
    }

    pub fn has_lower(&self) -> bool {
        self.lower > MININT
    }

    pub fn has_upper(&self) -> bool {
        self.upper < MAXINT
    }

    pub fn is_unbounded(&self) -> bool {
        !self.has_lower() && !self.has_upper() && self.tmask == u64::MAX
    }

    pub fn is_bool(&self) -> bool {
        self.lower >= 0 && self.upper <= 1
    }

    pub fn known_nonnegative(&self) -> bool {
        self.lower >= 0
    }

    pub fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper && (value as u64 & !self.tmask) == self.tvalue
    }

    /// Whether every member of `other` is a member of `self`
    pub fn contains_bound(&self, other: &IntBound) -> bool {
        self.lower <= other.lower
            && other.upper <= self.upper
            && other.tmask & !self.tmask == 0
            && (self.tvalue ^ other.tvalue) & !self.tmask == 0
    }

    pub fn known_lt(&self, other: &IntBound) -> bool {
        self.upper < other.lower
    }

    pub fn known_le(&self, other: &IntBound) -> bool {
        self.upper <= other.lower
    }

    pub fn known_gt(&self, other: &IntBound) -> bool {
        other.known_lt(self)
    }

    pub fn known_ge(&self, other: &IntBound) -> bool {
        other.known_le(self)
    }

    pub fn known_lt_const(&self, value: i64) -> bool {
        self.upper < value
    }

    pub fn known_gt_const(&self, value: i64) -> bool {
        self.lower > value
    }

    /// No member of `self` equals a member of `other`
    pub fn known_ne(&self, other: &IntBound) -> bool {
        if self.known_lt(other) || self.known_gt(other) {
            return true;
        }
        if (self.tvalue ^ other.tvalue) & !(self.tmask | other.tmask) != 0 {
            return true;
        }
        let mut trial = self.clone();
        trial.intersect(other).is_err()
    }

    pub fn known_eq(&self, other: &IntBound) -> bool {
        self.is_constant() && other.is_constant() && self.lower == other.lower
    }

    pub fn known_uint_lt(&self, other: &IntBound) -> bool {
        if self.known_nonnegative() && other.known_nonnegative() {
            return self.known_lt(other);
        }
        // negative numbers are the largest unsigned values
        self.known_nonnegative() && other.upper < 0
    }

    pub fn known_uint_le(&self, other: &IntBound) -> bool {
        if self.known_nonnegative() && other.known_nonnegative() {
            return self.known_le(other);
        }
        (self.known_nonnegative() && other.upper < 0) || (self.known_eq(other))
    }

    pub fn known_uint_gt(&self, other: &IntBound) -> bool {
        other.known_uint_lt(self)
    }

    pub fn known_uint_ge(&self, other: &IntBound) -> bool {
        other.known_uint_le(self)
    }

    /// Nullness of the value seen as a pointer or a truth value
    pub fn getnullness(&self) -> Nullness {
        if self.known_gt_const(0) || self.known_lt_const(0) || self.tvalue != 0 {
            Nullness::NonNull
        } else if self.get_constant() == Some(0) {
            Nullness::Null
        } else {
            Nullness::Unknown
        }
    }

    // ========== Mutators ==========

    fn update(&mut self, lower: i64, upper: i64) -> Result<bool> {
        if lower <= self.lower && upper >= self.upper {
            return Ok(false);
        }
        let lower = lower.max(self.lower);
        let upper = upper.min(self.upper);
        if lower > upper {
            return Err(Error::invalid_loop(format!(
                "{} cannot be narrowed to {}..={}",
                self, lower, upper
            )));
        }
        self.lower = lower;
        self.upper = upper;
        self.shrink()?;
        Ok(true)
    }

    pub fn make_le_const(&mut self, value: i64) -> Result<bool> {
        self.update(MININT, value)
    }

    pub fn make_lt_const(&mut self, value: i64) -> Result<bool> {
        if value == MININT {
            return Err(Error::invalid_loop("nothing is smaller than MININT"));
        }
        self.update(MININT, value - 1)
    }

    pub fn make_ge_const(&mut self, value: i64) -> Result<bool> {
        self.update(value, MAXINT)
    }

    pub fn make_gt_const(&mut self, value: i64) -> Result<bool> {
        if value == MAXINT {
            return Err(Error::invalid_loop("nothing is larger than MAXINT"));
        }
        self.update(value + 1, MAXINT)
    }

    pub fn make_le(&mut self, other: &IntBound) -> Result<bool> {
        self.make_le_const(other.upper)
    }

    pub fn make_lt(&mut self, other: &IntBound) -> Result<bool> {
        self.make_lt_const(other.upper)
    }

    pub fn make_ge(&mut self, other: &IntBound) -> Result<bool> {
        self.make_ge_const(other.lower)
    }

    pub fn make_gt(&mut self, other: &IntBound) -> Result<bool> {
        self.make_gt_const(other.lower)
    }

    pub fn make_eq_const(&mut self, value: i64) -> Result<bool> {
        self.intersect(&IntBound::from_constant(value))
    }

    pub fn make_ne_const(&mut self, value: i64) -> Result<bool> {
        if self.lower == value {
            self.make_gt_const(value)
        } else if self.upper == value {
            self.make_lt_const(value)
        } else {
            Ok(false)
        }
    }

    /// `self <u other`
    pub fn make_unsigned_lt(&mut self, other: &IntBound) -> Result<bool> {
        if other.known_nonnegative() {
            let mut changed = self.make_ge_const(0)?;
            changed |= self.make_lt_const(other.upper)?;
            Ok(changed)
        } else {
            Ok(false)
        }
    }

    /// `self <=u other`
    pub fn make_unsigned_le(&mut self, other: &IntBound) -> Result<bool> {
        if other.known_nonnegative() {
            let mut changed = self.make_ge_const(0)?;
            changed |= self.make_le_const(other.upper)?;
            Ok(changed)
        } else {
            Ok(false)
        }
    }

    /// `self >u other`
    pub fn make_unsigned_gt(&mut self, other: &IntBound) -> Result<bool> {
        if self.known_nonnegative() && other.known_nonnegative() {
            self.make_gt_const(other.lower)
        } else {
            Ok(false)
        }
    }

    /// `self >=u other`
    pub fn make_unsigned_ge(&mut self, other: &IntBound) -> Result<bool> {
        if self.known_nonnegative() && other.known_nonnegative() {
            self.make_ge_const(other.lower)
        } else {
            Ok(false)
        }
    }

    /// Restrict to the members of both bounds
    pub fn intersect(&mut self, other: &IntBound) -> Result<bool> {
        let lower = self.lower.max(other.lower);
        let upper = self.upper.min(other.upper);
        if lower > upper {
            return Err(Error::invalid_loop(format!(
                "{} and {} have no common value",
                self, other
            )));
        }
        let (tvalue, tmask) = tnum_intersect(self.tvalue, self.tmask, other.tvalue, other.tmask)
            .ok_or_else(|| {
                Error::invalid_loop(format!("{} and {} disagree on known bits", self, other))
            })?;
        let before = self.clone();
        self.lower = lower;
        self.upper = upper;
        self.tvalue = tvalue;
        self.tmask = tmask;
        self.shrink()?;
        Ok(*self != before)
    }

    /// A looser bound used when generalizing loop state
    pub fn widen(&self) -> IntBound {
        let lower = if self.lower < MININT / 2 { MININT } else { self.lower };
        let upper = if self.upper > MAXINT / 2 { MAXINT } else { self.upper };
        IntBound::from_parts(lower, upper, 0, u64::MAX)
    }

    // ========== Forward transfer functions ==========

    pub fn add_bound(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_add(self.tvalue, self.tmask, other.tvalue, other.tmask);
        match (
            self.lower.checked_add(other.lower),
            self.upper.checked_add(other.upper),
        ) {
            (Some(lower), Some(upper)) => IntBound::from_parts(lower, upper, tvalue, tmask),
            _ => IntBound::from_knownbits(tvalue, tmask),
        }
    }

    /// Bound of `self + other` when the addition is known not to overflow
    pub fn add_bound_no_overflow(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_add(self.tvalue, self.tmask, other.tvalue, other.tmask);
        IntBound::from_parts(
            self.lower.saturating_add(other.lower),
            self.upper.saturating_add(other.upper),
            tvalue,
            tmask,
        )
    }

    pub fn add_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        self.lower.checked_add(other.lower).is_some() && self.upper.checked_add(other.upper).is_some()
    }

    pub fn sub_bound(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_sub(self.tvalue, self.tmask, other.tvalue, other.tmask);
        match (
            self.lower.checked_sub(other.upper),
            self.upper.checked_sub(other.lower),
        ) {
            (Some(lower), Some(upper)) => IntBound::from_parts(lower, upper, tvalue, tmask),
            _ => IntBound::from_knownbits(tvalue, tmask),
        }
    }

    pub fn sub_bound_no_overflow(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_sub(self.tvalue, self.tmask, other.tvalue, other.tmask);
        IntBound::from_parts(
            self.lower.saturating_sub(other.upper),
            self.upper.saturating_sub(other.lower),
            tvalue,
            tmask,
        )
    }

    pub fn sub_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        self.lower.checked_sub(other.upper).is_some() && self.upper.checked_sub(other.lower).is_some()
    }

    fn mul_corners(&self, other: &IntBound) -> Option<(i64, i64)> {
        let corners = [
            self.lower.checked_mul(other.lower)?,
            self.lower.checked_mul(other.upper)?,
            self.upper.checked_mul(other.lower)?,
            self.upper.checked_mul(other.upper)?,
        ];
        let lower = corners.iter().copied().min()?;
        let upper = corners.iter().copied().max()?;
        Some((lower, upper))
    }

    /// Known low zero bits of a product
    fn mul_knownbits(&self, other: &IntBound) -> (u64, u64) {
        if let (Some(a), Some(b)) = (self.get_constant(), other.get_constant()) {
            return (a.wrapping_mul(b) as u64, 0);
        }
        let zeros = (self.tvalue | self.tmask).trailing_zeros()
            + (other.tvalue | other.tmask).trailing_zeros();
        if zeros >= 64 {
            (0, 0)
        } else {
            (0, u64::MAX << zeros)
        }
    }

    pub fn mul_bound(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = self.mul_knownbits(other);
        match self.mul_corners(other) {
            Some((lower, upper)) => IntBound::from_parts(lower, upper, tvalue, tmask),
            None => IntBound::from_knownbits(tvalue, tmask),
        }
    }

    pub fn mul_bound_no_overflow(&self, other: &IntBound) -> IntBound {
        match self.mul_corners(other) {
            Some(_) => self.mul_bound(other),
            None => {
                let (tvalue, tmask) = self.mul_knownbits(other);
                IntBound::from_knownbits(tvalue, tmask)
            }
        }
    }

    pub fn mul_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        self.mul_corners(other).is_some()
    }

    /// Floor division
    pub fn py_div_bound(&self, other: &IntBound) -> IntBound {
        if other.lower <= 0 && other.upper >= 0 {
            return IntBound::unbounded();
        }
        if self.lower == MININT && other.contains(-1) {
            return IntBound::unbounded();
        }
        let div = |a: i64, b: i64| crate::ir::eval::py_div(a, b);
        let corners = [
            div(self.lower, other.lower),
            div(self.lower, other.upper),
            div(self.upper, other.lower),
            div(self.upper, other.upper),
        ];
        let corners: Option<Vec<i64>> = corners.into_iter().collect();
        match corners {
            Some(c) => {
                let lower = c.iter().copied().min().unwrap_or(MININT);
                let upper = c.iter().copied().max().unwrap_or(MAXINT);
                IntBound::from_parts(lower, upper, 0, u64::MAX)
            }
            None => IntBound::unbounded(),
        }
    }

    /// Floor modulo: the result has the sign of the divisor
    pub fn mod_bound(&self, other: &IntBound) -> IntBound {
        let lower = if other.lower < 0 { other.lower + 1 } else { 0 };
        let mut upper = if other.upper > 0 { other.upper - 1 } else { 0 };
        if self.known_nonnegative() && other.lower > 0 {
            upper = upper.min(self.upper);
        }
        IntBound::from_parts(lower, upper, 0, u64::MAX)
    }

    fn shift_range(&self) -> Option<(u32, u32)> {
        if self.lower >= 0 && self.upper < 64 {
            Some((self.lower as u32, self.upper as u32))
        } else {
            None
        }
    }

    pub fn lshift_bound(&self, other: &IntBound) -> IntBound {
        let Some((lo, hi)) = other.shift_range() else {
            return IntBound::unbounded();
        };
        let (tvalue, tmask) = if lo == hi {
            (self.tvalue << lo, self.tmask << lo)
        } else {
            let zeros = ((self.tvalue | self.tmask).trailing_zeros() + lo).min(64);
            if zeros >= 64 {
                (0, 0)
            } else {
                (0, u64::MAX << zeros)
            }
        };
        if self.lshift_bound_cannot_overflow(other) {
            let corners = [
                self.lower << lo,
                self.lower << hi,
                self.upper << lo,
                self.upper << hi,
            ];
            let lower = corners.iter().copied().min().unwrap_or(MININT);
            let upper = corners.iter().copied().max().unwrap_or(MAXINT);
            IntBound::from_parts(lower, upper, tvalue, tmask)
        } else {
            IntBound::from_knownbits(tvalue, tmask)
        }
    }

    pub fn lshift_bound_cannot_overflow(&self, other: &IntBound) -> bool {
        let Some((_, hi)) = other.shift_range() else {
            return false;
        };
        (self.lower << hi) >> hi == self.lower && (self.upper << hi) >> hi == self.upper
    }

    /// Arithmetic shift right
    pub fn rshift_bound(&self, other: &IntBound) -> IntBound {
        let Some((lo, hi)) = other.shift_range() else {
            return IntBound::unbounded();
        };
        let (tvalue, tmask) = if lo == hi {
            (
                ((self.tvalue as i64) >> lo) as u64,
                ((self.tmask as i64) >> lo) as u64,
            )
        } else {
            (0, u64::MAX)
        };
        let corners = [
            self.lower >> lo,
            self.lower >> hi,
            self.upper >> lo,
            self.upper >> hi,
        ];
        let lower = corners.iter().copied().min().unwrap_or(MININT);
        let upper = corners.iter().copied().max().unwrap_or(MAXINT);
        IntBound::from_parts(lower, upper, tvalue, tmask)
    }

    /// Logical shift right
    pub fn urshift_bound(&self, other: &IntBound) -> IntBound {
        let Some((lo, hi)) = other.shift_range() else {
            return IntBound::unbounded();
        };
        let (tvalue, tmask) = if lo == hi {
            (self.tvalue >> lo, self.tmask >> lo)
        } else {
            (0, u64::MAX)
        };
        if self.known_nonnegative() {
            IntBound::from_parts(self.lower >> hi, self.upper >> lo, tvalue, tmask)
        } else if lo > 0 {
            IntBound::from_parts(0, (u64::MAX >> lo) as i64, tvalue, tmask)
        } else {
            IntBound::from_knownbits(tvalue, tmask)
        }
    }

    pub fn and_bound(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_and(self.tvalue, self.tmask, other.tvalue, other.tmask);
        let pos1 = self.known_nonnegative();
        let pos2 = other.known_nonnegative();
        let mut lower = MININT;
        let mut upper = MAXINT;
        if pos1 || pos2 {
            lower = 0;
        }
        if pos1 {
            upper = upper.min(self.upper);
        }
        if pos2 {
            upper = upper.min(other.upper);
        }
        IntBound::from_parts(lower, upper, tvalue, tmask)
    }

    fn or_xor_range(&self, other: &IntBound) -> (i64, i64) {
        if self.known_nonnegative() && other.known_nonnegative() {
            let most_significant = (self.upper | other.upper) as u64;
            (0, next_pow2_m1(most_significant) as i64)
        } else {
            (MININT, MAXINT)
        }
    }

    pub fn or_bound(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_or(self.tvalue, self.tmask, other.tvalue, other.tmask);
        let (lower, upper) = self.or_xor_range(other);
        IntBound::from_parts(lower, upper, tvalue, tmask)
    }

    pub fn xor_bound(&self, other: &IntBound) -> IntBound {
        let (tvalue, tmask) = tnum_xor(self.tvalue, self.tmask, other.tvalue, other.tmask);
        let (lower, upper) = self.or_xor_range(other);
        IntBound::from_parts(lower, upper, tvalue, tmask)
    }

    pub fn invert_bound(&self) -> IntBound {
        IntBound::from_parts(!self.upper, !self.lower, !self.tvalue & !self.tmask, self.tmask)
    }

    pub fn neg_bound(&self) -> IntBound {
        self.invert_bound().add_bound(&IntBound::from_constant(1))
    }

    // ========== Backward transfer functions ==========

    /// Bound of `x` given `x & self == result`
    pub fn and_bound_backwards(&self, result: &IntBound) -> Result<IntBound> {
        if result.tvalue & !self.tmask & !self.tvalue != 0 {
            return Err(Error::invalid_loop(format!(
                "{} & {} cannot have a bit set",
                result, self
            )));
        }
        let tvalue = result.tvalue;
        let tmask = (!self.tvalue | result.tmask) & !tvalue;
        Ok(IntBound::from_knownbits(tvalue, tmask))
    }

    /// Bound of `x` given `x | self == result`
    pub fn or_bound_backwards(&self, result: &IntBound) -> Result<IntBound> {
        let zeros = !result.tmask & !result.tvalue;
        if self.tvalue & zeros != 0 {
            return Err(Error::invalid_loop(format!(
                "{} | {} cannot have a bit cleared",
                result, self
            )));
        }
        let tvalue = result.tvalue & !self.tvalue & !self.tmask;
        let tmask = !(zeros | tvalue);
        Ok(IntBound::from_knownbits(tvalue, tmask))
    }

    /// Bound of `x` given `x >> shift == self` (arithmetic or logical)
    pub fn rshift_bound_backwards(&self, shift: i64) -> IntBound {
        if !(0..64).contains(&shift) {
            return IntBound::unbounded();
        }
        let low = (1u64 << shift) - 1;
        IntBound::from_knownbits(self.tvalue << shift, (self.tmask << shift) | low)
    }

    pub fn urshift_bound_backwards(&self, shift: i64) -> IntBound {
        self.rshift_bound_backwards(shift)
    }

    /// Bound of `x` given `x << shift == self`
    pub fn lshift_bound_backwards(&self, shift: i64) -> Result<IntBound> {
        if !(0..64).contains(&shift) {
            return Ok(IntBound::unbounded());
        }
        let low = (1u64 << shift) - 1;
        if self.tvalue & low != 0 {
            return Err(Error::invalid_loop(format!(
                "{} has low bits set but is a left shift by {}",
                self, shift
            )));
        }
        let high = !(u64::MAX >> shift);
        Ok(IntBound::from_knownbits(
            self.tvalue >> shift,
            (self.tmask >> shift) | high,
        ))
    }

    // ========== Guards ==========

    /// Operations that check at runtime that `value` lies in this bound.
    ///
    /// `emit` appends an operation and returns its result reference; guards
    /// are emitted without fail args.
    pub fn make_guards(&self, value: &Operand, emit: &mut dyn FnMut(Op) -> OpRef) {
        if let Some(c) = self.get_constant() {
            emit(Op::void(OpCode::GuardValue, vec![value.clone(), Operand::int(c)]));
            return;
        }
        if self.has_lower() {
            let cmp = emit(Op::new(
                OpCode::IntGe,
                Type::Int,
                vec![value.clone(), Operand::int(self.lower)],
            ));
            emit(Op::void(OpCode::GuardTrue, vec![cmp.into()]));
        }
        if self.has_upper() {
            let cmp = emit(Op::new(
                OpCode::IntLe,
                Type::Int,
                vec![value.clone(), Operand::int(self.upper)],
            ));
            emit(Op::void(OpCode::GuardTrue, vec![cmp.into()]));
        }
        let implied = IntBound::from_parts(self.lower, self.upper, 0, u64::MAX);
        if implied.tmask != self.tmask {
            let masked = emit(Op::new(
                OpCode::IntAnd,
                Type::Int,
                vec![value.clone(), Operand::int(!self.tmask as i64)],
            ));
            emit(Op::void(
                OpCode::GuardValue,
                vec![masked.into(), Operand::int(self.tvalue as i64)],
            ));
        }
    }

    /// Constant operand, if this bound is a single value
    pub fn as_const(&self) -> Option<Const> {
        self.get_constant().map(Const::Int)
    }
}

impl fmt::Display for IntBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(c) = self.get_constant() {
            return write!(f, "IntBound({})", c);
        }
        write!(f, "IntBound(")?;
        match (self.has_lower(), self.has_upper()) {
            (true, true) => write!(f, "{}..={}", self.lower, self.upper)?,
            (true, false) => write!(f, "{}..", self.lower)?,
            (false, true) => write!(f, "..={}", self.upper)?,
            (false, false) => write!(f, "..")?,
        }
        if self.tmask != u64::MAX {
            write!(f, ", known={:#x}/{:#x}", self.tvalue, !self.tmask)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(lower: i64, upper: i64) -> IntBound {
        IntBound::new(lower, upper).unwrap()
    }

    #[test]
    fn test_shrink_common_prefix() {
        let bound = b(8, 15);
        assert_eq!(bound.tvalue, 8);
        assert_eq!(bound.tmask, 7);
        let bound = b(-4, -1);
        assert_eq!(bound.tmask, 3);
        assert_eq!(bound.tvalue, (-4i64) as u64);
    }

    #[test]
    fn test_shrink_bounds_by_knownbits() {
        // even numbers in 1..=9 are 2..=8
        let bound = IntBound::new_full(1, 9, 0, !1).unwrap();
        assert_eq!((bound.lower, bound.upper), (2, 8));
        // nothing odd in 4..=4
        assert!(IntBound::new_full(4, 4, 1, !1).is_err());
    }

    #[test]
    fn test_min_max_by_knownbits() {
        // values of the form 0b1?0
        let mask = 0b010;
        assert_eq!(min_unsigned_atleast(0, 0b100, mask), Some(0b100));
        assert_eq!(min_unsigned_atleast(0b101, 0b100, mask), Some(0b110));
        assert_eq!(min_unsigned_atleast(0b111, 0b100, mask), None);
        assert_eq!(max_unsigned_atmost(0b101, 0b100, mask), Some(0b100));
        assert_eq!(max_unsigned_atmost(0b011, 0b100, mask), None);
    }

    #[test]
    fn test_add_and_overflow() {
        let x = b(0, 10);
        let y = b(5, 6);
        let r = x.add_bound(&y);
        assert_eq!((r.lower, r.upper), (5, 16));
        let big = b(MAXINT - 1, MAXINT);
        let r = big.add_bound(&b(1, 1));
        assert!(!r.has_lower() && !r.has_upper());
        assert!(!big.add_bound_cannot_overflow(&b(1, 1)));
        let r = big.add_bound_no_overflow(&b(1, 1));
        assert_eq!(r.upper, MAXINT);
    }

    #[test]
    fn test_mul_and_div() {
        let r = b(-2, 3).mul_bound(&b(4, 5));
        assert_eq!((r.lower, r.upper), (-10, 15));
        let r = b(-7, 7).py_div_bound(&b(2, 2));
        assert_eq!((r.lower, r.upper), (-4, 3));
        assert!(b(0, 10).py_div_bound(&b(-1, 1)).is_unbounded());
        let r = b(0, 100).mod_bound(&b(8, 8));
        assert_eq!((r.lower, r.upper), (0, 7));
        let r = b(-100, 100).mod_bound(&b(-8, -8));
        assert_eq!((r.lower, r.upper), (-7, 0));
    }

    #[test]
    fn test_bitwise() {
        let r = IntBound::unbounded().and_bound(&IntBound::from_constant(0xff));
        assert_eq!((r.lower, r.upper), (0, 255));
        let r = b(0, 5).or_bound(&b(0, 9));
        assert_eq!((r.lower, r.upper), (0, 15));
        let x = IntBound::from_knownbits(0b10, !0b11);
        let y = IntBound::from_knownbits(0b01, !0b11);
        let r = x.and_bound(&y);
        assert_eq!(r.get_constant(), None);
        assert_eq!(r.tvalue & 0b11, 0);
        assert_eq!(r.tmask & 0b11, 0);
        let r = b(3, 3).invert_bound();
        assert_eq!(r.get_constant(), Some(-4));
        let r = b(1, 5).neg_bound();
        assert_eq!((r.lower, r.upper), (-5, -1));
    }

    #[test]
    fn test_shifts() {
        let r = b(1, 3).lshift_bound(&IntBound::from_constant(4));
        assert_eq!((r.lower, r.upper), (16, 48));
        assert_eq!(r.tmask & 0xf, 0);
        let r = b(-16, 16).rshift_bound(&IntBound::from_constant(2));
        assert_eq!((r.lower, r.upper), (-4, 4));
        let r = IntBound::unbounded().urshift_bound(&IntBound::from_constant(60));
        assert_eq!((r.lower, r.upper), (0, 15));
        assert!(!b(1, MAXINT).lshift_bound_cannot_overflow(&IntBound::from_constant(1)));
    }

    #[test]
    fn test_backwards() {
        // x & 0b1100 == 0b0100 tells bit 2 is set and bit 3 is clear
        let other = IntBound::from_constant(0b1100);
        let result = IntBound::from_constant(0b0100);
        let x = other.and_bound_backwards(&result).unwrap();
        assert_eq!(x.tvalue & 0b1100, 0b0100);
        assert_eq!(x.tmask & 0b1100, 0);
        assert!(IntBound::from_constant(0)
            .and_bound_backwards(&IntBound::from_constant(1))
            .is_err());

        let x = IntBound::from_constant(0b01)
            .or_bound_backwards(&IntBound::from_constant(0b11))
            .unwrap();
        assert_eq!(x.tvalue & 0b11, 0b10);
        assert_eq!(x.tmask & 0b10, 0);

        let x = IntBound::from_constant(3).rshift_bound_backwards(2);
        assert_eq!((x.lower, x.upper), (12, 15));
        let x = IntBound::from_constant(12).lshift_bound_backwards(2).unwrap();
        assert_eq!(x.tvalue & 0xff, 3);
        assert!(IntBound::from_constant(13).lshift_bound_backwards(2).is_err());
    }

    #[test]
    fn test_comparisons() {
        let x = b(0, 9);
        assert!(x.known_lt(&b(10, 20)));
        assert!(!x.known_lt(&b(9, 20)));
        assert!(x.known_le(&b(9, 20)));
        let even = IntBound::from_knownbits(0, !1);
        let odd = IntBound::from_knownbits(1, !1);
        assert!(even.known_ne(&odd));
        assert!(x.known_uint_lt(&b(-5, -1)));
        assert_eq!(b(1, 9).getnullness(), Nullness::NonNull);
        assert_eq!(b(0, 0).getnullness(), Nullness::Null);
        assert_eq!(b(0, 9).getnullness(), Nullness::Unknown);
    }

    #[test]
    fn test_mutators() {
        let mut x = IntBound::unbounded();
        assert!(x.make_lt_const(10).unwrap());
        assert!(!x.make_le_const(20).unwrap());
        assert!(x.make_ge_const(0).unwrap());
        assert_eq!((x.lower, x.upper), (0, 9));
        assert!(x.make_ne_const(9).unwrap());
        assert_eq!(x.upper, 8);
        assert!(x.make_gt_const(8).is_err());
        let mut y = b(0, 100);
        assert!(y.intersect(&IntBound::from_knownbits(0, !0b111)).unwrap());
        assert_eq!(y.upper, 96);
        assert!(IntBound::from_constant(3).contains_bound(&IntBound::from_constant(3)));
        assert!(b(0, 10).contains_bound(&b(2, 3)));
        assert!(!b(2, 3).contains_bound(&b(0, 10)));
        let wide = b(-5, MAXINT - 3).widen();
        assert_eq!((wide.lower, wide.upper), (-5, MAXINT));
    }

    #[test]
    fn test_make_guards() {
        let mut ops = Vec::new();
        let mut emit = |op: Op| {
            ops.push(op);
            OpRef(100 + ops.len() as u32)
        };
        b(0, 9).make_guards(&Operand::Op(OpRef(0)), &mut emit);
        let opcodes: Vec<OpCode> = ops.iter().map(|op| op.opcode).collect();
        assert_eq!(
            opcodes,
            vec![OpCode::IntGe, OpCode::GuardTrue, OpCode::IntLe, OpCode::GuardTrue]
        );

        let mut ops = Vec::new();
        let mut emit = |op: Op| {
            ops.push(op);
            OpRef(100 + ops.len() as u32)
        };
        IntBound::new_full(0, 100, 0, !1)
            .unwrap()
            .make_guards(&Operand::Op(OpRef(0)), &mut emit);
        assert_eq!(ops.last().map(|op| op.opcode), Some(OpCode::GuardValue));
        assert_eq!(ops[ops.len() - 2].opcode, OpCode::IntAnd);
    }
}
