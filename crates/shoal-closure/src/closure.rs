// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::any::type_name;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::registry::{self, value_label, WireValue};
use crate::{codec, ClosureError};

// ── Wire form ─────────────────────────────────────────────────────────────────

/// The transportable half of a closure: a registry label plus the payload
/// bytes its decoder consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireForm {
    pub label: String,
    pub payload: Vec<u8>,
}

impl WireForm {
    /// Canonical byte layout used inside protocol envelopes:
    ///
    /// ```text
    /// label_len_u16_be (2)
    /// label_bytes      (N)
    /// payload_bytes    (rest)
    /// ```
    pub fn to_bytes(&self) -> Result<Vec<u8>, ClosureError> {
        let label = self.label.as_bytes();
        if label.len() > u16::MAX as usize {
            return Err(ClosureError::Wire(format!(
                "label length {} exceeds u16",
                label.len()
            )));
        }
        let mut out = Vec::with_capacity(2 + label.len() + self.payload.len());
        out.extend_from_slice(&(label.len() as u16).to_be_bytes());
        out.extend_from_slice(label);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClosureError> {
        if bytes.len() < 2 {
            return Err(ClosureError::Wire("truncated closure header".to_string()));
        }
        let label_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + label_len {
            return Err(ClosureError::Wire("truncated closure label".to_string()));
        }
        let label = std::str::from_utf8(&bytes[2..2 + label_len])
            .map_err(|e| ClosureError::Wire(format!("label is not UTF-8: {e}")))?
            .to_string();
        Ok(WireForm {
            label,
            payload: bytes[2 + label_len..].to_vec(),
        })
    }
}

// ── Closure ───────────────────────────────────────────────────────────────────

/// An executable-plus-serialisable value.
///
/// Locally a closure is a thunk of type `T`; on the wire it is its
/// [`WireForm`].  A closure received from another node starts with an empty
/// thunk slot, which [`Closure::thunk`] fills on first use by running the
/// registered decoder.  Serialisation always ships the wire form only.
#[derive(Clone)]
pub struct Closure<T> {
    wire: WireForm,
    thunk: OnceLock<T>,
}

impl<T> Closure<T> {
    /// A closure whose thunk will be materialised through the registry on
    /// demand — the shape every received closure has.
    pub fn from_wire(wire: WireForm) -> Self {
        Closure {
            wire,
            thunk: OnceLock::new(),
        }
    }

    /// A locally constructed closure: thunk in hand, wire form describing
    /// how a receiver rebuilds it.  The building block for registration
    /// helpers that pair a label with a code pointer.
    pub fn with_thunk(wire: WireForm, thunk: T) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(thunk);
        Closure { wire, thunk: cell }
    }

    pub fn wire(&self) -> &WireForm {
        &self.wire
    }

    pub fn label(&self) -> &str {
        &self.wire.label
    }

    /// Whether the thunk has been built (locally constructed or already
    /// materialised).
    pub fn is_materialized(&self) -> bool {
        self.thunk.get().is_some()
    }
}

impl<T: Send + Sync + 'static> Closure<T> {
    /// The local thunk, materialising it through the static table if this
    /// closure arrived over the wire.  An unknown label is a fatal protocol
    /// error ([`ClosureError::RegistryMiss`]).
    pub fn thunk(&self) -> Result<&T, ClosureError> {
        if let Some(t) = self.thunk.get() {
            return Ok(t);
        }
        let decoder = registry::lookup(&self.wire.label)?;
        let boxed = decoder(&self.wire.payload)?;
        let t = boxed
            .downcast::<T>()
            .map_err(|_| ClosureError::TypeMismatch(self.wire.label.clone()))?;
        // Two tasks may race to materialise; first write wins, both observe
        // the same decoder output.
        let _ = self.thunk.set(*t);
        Ok(self.thunk.get().expect("thunk just materialised"))
    }
}

impl<T: WireValue> Closure<T> {
    /// The thunk as an owned value.
    pub fn value(&self) -> Result<T, ClosureError> {
        Ok(self.thunk()?.clone())
    }

    /// Evaluate to normal form and replace the wire form with one whose
    /// payload *is* the evaluated value, so later serialisation ships data
    /// rather than a recipe.  Idempotent on already-forced closures.
    pub fn force(&self) -> Result<Closure<T>, ClosureError> {
        if self.wire.label == value_label::<T>() {
            return Ok(self.clone());
        }
        to_closure(self.thunk()?)
    }
}

impl<T> fmt::Debug for Closure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("label", &self.wire.label)
            .field("payload_len", &self.wire.payload.len())
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

impl<T> Serialize for Closure<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.wire.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Closure<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Closure::from_wire(WireForm::deserialize(deserializer)?))
    }
}

/// Lift a normal-formable value into a closure.  The wire form names the
/// value's registered encoding (see [`registry::register_value`]).
pub fn to_closure<T: WireValue>(value: &T) -> Result<Closure<T>, ClosureError> {
    let wire = WireForm {
        label: value_label::<T>(),
        payload: codec::encode(value)?,
    };
    Ok(Closure::with_thunk(wire, value.clone()))
}

// ── Function closures ─────────────────────────────────────────────────────────

/// Thunk of a shippable unary function.
pub struct FnThunk<A, B>(pub Arc<dyn Fn(A) -> B + Send + Sync>);

impl<A, B> Clone for FnThunk<A, B> {
    fn clone(&self) -> Self {
        FnThunk(self.0.clone())
    }
}

pub type FnClosure<A, B> = Closure<FnThunk<A, B>>;

/// Register a plain function under `label`.  The payload is empty; both
/// sides rebuild the thunk from the code pointer baked into the binary.
pub fn register_fn<A, B>(label: impl Into<String>, f: fn(A) -> B) -> Result<(), ClosureError>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    registry::ensure(label, || {
        Box::new(move |_bytes| Ok(Box::new(FnThunk(Arc::new(f) as Arc<dyn Fn(A) -> B + Send + Sync>))))
    })
}

/// Closure over a registered plain function.  `label` must match the
/// [`register_fn`] call made during startup.
pub fn fn_closure<A, B>(label: impl Into<String>, f: fn(A) -> B) -> FnClosure<A, B>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    Closure::with_thunk(
        WireForm {
            label: label.into(),
            payload: Vec::new(),
        },
        FnThunk(Arc::new(f)),
    )
}

/// Register a function with a serialisable captured environment.
pub fn register_fn_env<E, A, B>(
    label: impl Into<String>,
    f: fn(E, A) -> B,
) -> Result<(), ClosureError>
where
    E: WireValue,
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    registry::ensure(label, || {
        Box::new(move |bytes| {
            let env: E = codec::decode(bytes)?;
            Ok(Box::new(FnThunk(
                Arc::new(move |a| f(env.clone(), a)) as Arc<dyn Fn(A) -> B + Send + Sync>
            )))
        })
    })
}

/// Closure over a registered environment-capturing function.
pub fn fn_env_closure<E, A, B>(
    label: impl Into<String>,
    f: fn(E, A) -> B,
    env: &E,
) -> Result<FnClosure<A, B>, ClosureError>
where
    E: WireValue,
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    let wire = WireForm {
        label: label.into(),
        payload: codec::encode(env)?,
    };
    let captured = env.clone();
    Ok(Closure::with_thunk(
        wire,
        FnThunk(Arc::new(move |a| f(captured.clone(), a))),
    ))
}

// ── Full normal form ──────────────────────────────────────────────────────────

/// Full normal-form evaluation for values that may embed closures.
///
/// [`Closure::force`] rewrites one closure's own wire form; it never looks
/// inside the value it encodes.  A value shaped like `Vec<Closure<U>>`
/// would therefore ship with its inner recipes unevaluated.  `force_nf`
/// closes that gap: it rebuilds the value with every embedded closure
/// forced to its value encoding, recursively.  Plain data is its own
/// normal form.
pub trait ForceNf: Sized {
    fn force_nf(&self) -> Result<Self, ClosureError>;
}

macro_rules! impl_force_nf_atomic {
    ($($ty:ty),* $(,)?) => {
        $(impl ForceNf for $ty {
            fn force_nf(&self) -> Result<Self, ClosureError> {
                Ok(self.clone())
            }
        })*
    };
}

impl_force_nf_atomic!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
);

impl<T: ForceNf> ForceNf for Vec<T> {
    fn force_nf(&self) -> Result<Self, ClosureError> {
        self.iter().map(ForceNf::force_nf).collect()
    }
}

impl<T: ForceNf> ForceNf for Option<T> {
    fn force_nf(&self) -> Result<Self, ClosureError> {
        self.as_ref().map(ForceNf::force_nf).transpose()
    }
}

impl<A: ForceNf, B: ForceNf> ForceNf for (A, B) {
    fn force_nf(&self) -> Result<Self, ClosureError> {
        Ok((self.0.force_nf()?, self.1.force_nf()?))
    }
}

impl<A: ForceNf, B: ForceNf, C: ForceNf> ForceNf for (A, B, C) {
    fn force_nf(&self) -> Result<Self, ClosureError> {
        Ok((self.0.force_nf()?, self.1.force_nf()?, self.2.force_nf()?))
    }
}

impl<T: WireValue + ForceNf> ForceNf for Closure<T> {
    fn force_nf(&self) -> Result<Self, ClosureError> {
        // Materialise, normalise the payload underneath, and re-lift; the
        // result carries the value encoding at every closure level.
        to_closure(&self.thunk()?.force_nf()?)
    }
}

// ── Application and composition ───────────────────────────────────────────────

fn apply_label<A: 'static, B: 'static>() -> String {
    format!("shoal.apply<{} -> {}>", type_name::<A>(), type_name::<B>())
}

fn compose_label<A: 'static, B: 'static, C: 'static>() -> String {
    format!(
        "shoal.compose<{} -> {} -> {}>",
        type_name::<A>(),
        type_name::<B>(),
        type_name::<C>()
    )
}

/// Register the application combinator at `A -> B`, required before
/// closures built by [`apply`] at these types can be materialised.
pub fn register_apply<A: WireValue, B: WireValue>() -> Result<(), ClosureError> {
    registry::ensure(apply_label::<A, B>(), || {
        Box::new(|bytes| {
            let (fw, xw): (WireForm, WireForm) = codec::decode(bytes)?;
            let f: FnClosure<A, B> = Closure::from_wire(fw);
            let x: Closure<A> = Closure::from_wire(xw);
            let y: B = (f.thunk()?.0)(x.value()?);
            Ok(Box::new(y))
        })
    })
}

/// Closure for `f` applied to `x`.  The wire form reconstructs the
/// application from registered primitives; nothing is evaluated until the
/// result's thunk is demanded.
pub fn apply<A: WireValue, B: WireValue>(
    f: &FnClosure<A, B>,
    x: &Closure<A>,
) -> Result<Closure<B>, ClosureError> {
    let payload = codec::encode(&(f.wire(), x.wire()))?;
    Ok(Closure::from_wire(WireForm {
        label: apply_label::<A, B>(),
        payload,
    }))
}

/// Register the composition combinator at `A -> B -> C`.
pub fn register_compose<A, B, C>() -> Result<(), ClosureError>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    registry::ensure(compose_label::<A, B, C>(), || {
        Box::new(|bytes| {
            let (gw, fw): (WireForm, WireForm) = codec::decode(bytes)?;
            let g: FnClosure<B, C> = Closure::from_wire(gw);
            let f: FnClosure<A, B> = Closure::from_wire(fw);
            let gt = g.thunk()?.clone();
            let ft = f.thunk()?.clone();
            Ok(Box::new(FnThunk(
                Arc::new(move |a| (gt.0)((ft.0)(a))) as Arc<dyn Fn(A) -> C + Send + Sync>
            )))
        })
    })
}

/// Closure for `g ∘ f`.
pub fn compose<A, B, C>(
    g: &FnClosure<B, C>,
    f: &FnClosure<A, B>,
) -> Result<FnClosure<A, C>, ClosureError>
where
    A: Send + Sync + 'static,
    B: Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let payload = codec::encode(&(g.wire(), f.wire()))?;
    Ok(Closure::from_wire(WireForm {
        label: compose_label::<A, B, C>(),
        payload,
    }))
}
