//! The handful of natives named in spec §4.4 as worked examples of the
//! binding mechanism, not a standard library: `Clock`, `Sleep` as free
//! globals, and one array method (`Length`) plus one string method
//! (`ToNum`) exercising the `BoundNativeMethod` path (§3).

use std::time::{SystemTime, UNIX_EPOCH};

use brace_core::{Heap, NativeSignal, ObjData, Value};

/// `Clock() -> Num`: wall-clock seconds since the Unix epoch.
pub fn clock(_heap: &mut Heap, _args: &[Value]) -> Result<Value, NativeSignal> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(Value::Number(secs))
}

/// `Sleep(ms) -> Null`: blocks the (single) VM thread for `ms` milliseconds.
pub fn sleep(_heap: &mut Heap, args: &[Value]) -> Result<Value, NativeSignal> {
    let ms = match args.first() {
        Some(Value::Number(n)) => *n,
        _ => return Err(NativeSignal { message: "Sleep expects a Num argument.".to_string() }),
    };
    if ms > 0.0 {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
    Ok(Value::Null)
}

/// `<array>.Length() -> Num`. Called with `args[0]` as the bound receiver
/// (see `callValue`'s `BoundNativeMethod` handling).
pub fn array_length(heap: &mut Heap, args: &[Value]) -> Result<Value, NativeSignal> {
    let Some(Value::Obj(h)) = args.first() else {
        return Err(NativeSignal { message: "Length expects an array receiver.".to_string() });
    };
    let ObjData::Array(a) = heap.data(*h) else {
        return Err(NativeSignal { message: "Length expects an array receiver.".to_string() });
    };
    Ok(Value::Number(a.values.len() as f64))
}

/// `<string>.ToNum() -> Num`: parses the receiver's text as a double,
/// matching Testable Property 4's round-trip with `Print`/`Str`.
pub fn str_to_num(heap: &mut Heap, args: &[Value]) -> Result<Value, NativeSignal> {
    let Some(Value::Obj(h)) = args.first() else {
        return Err(NativeSignal { message: "ToNum expects a string receiver.".to_string() });
    };
    let ObjData::Str(s) = heap.data(*h) else {
        return Err(NativeSignal { message: "ToNum expects a string receiver.".to_string() });
    };
    s.chars
        .trim()
        .parse::<f64>()
        .map(Value::Number)
        .map_err(|_| NativeSignal { message: format!("Cannot parse '{}' as Num.", s.chars) })
}
