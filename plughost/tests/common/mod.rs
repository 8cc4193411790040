//! Guest modules and host functions shared by the integration tests.

#![allow(dead_code)]

use plughost::{Error, Function, PTR, UserData};

/// Guest using only the kernel imports.
pub const GUEST_WAT: &str = r#"
(module
  (import "env" "extism_input_offset" (func $input_offset (result i64)))
  (import "env" "extism_input_length" (func $input_length (result i64)))
  (import "env" "extism_length" (func $length (param i64) (result i64)))
  (import "env" "extism_alloc" (func $alloc (param i64) (result i64)))
  (import "env" "extism_load_u8" (func $load_u8 (param i64) (result i32)))
  (import "env" "extism_store_u8" (func $store_u8 (param i64 i32)))
  (import "env" "extism_output_set" (func $output_set (param i64 i64)))
  (import "env" "extism_error_set" (func $error_set (param i64)))
  (import "env" "extism_config_get" (func $config_get (param i64) (result i64)))
  (import "env" "extism_var_get" (func $var_get (param i64) (result i64)))
  (import "env" "extism_var_set" (func $var_set (param i64 i64)))
  (import "env" "extism_log_info" (func $log_info (param i64)))

  (func $put (param $at i64) (param $byte i32)
    (call $store_u8 (local.get $at) (local.get $byte)))

  ;; Writes {"count": N} where N is the number of ASCII vowels in the input.
  (func (export "count_vowels") (result i32)
    (local $ptr i64) (local $end i64) (local $c i32) (local $count i32)
    (local $digits i64) (local $t i32) (local $out i64) (local $pos i64)
    (local.set $ptr (call $input_offset))
    (local.set $end (i64.add (local.get $ptr) (call $input_length)))
    (block $scanned
      (loop $scan
        (br_if $scanned (i64.ge_u (local.get $ptr) (local.get $end)))
        (local.set $c (i32.or (call $load_u8 (local.get $ptr)) (i32.const 0x20)))
        (if (i32.or
              (i32.or
                (i32.or (i32.eq (local.get $c) (i32.const 97)) (i32.eq (local.get $c) (i32.const 101)))
                (i32.or (i32.eq (local.get $c) (i32.const 105)) (i32.eq (local.get $c) (i32.const 111))))
              (i32.eq (local.get $c) (i32.const 117)))
          (then (local.set $count (i32.add (local.get $count) (i32.const 1)))))
        (local.set $ptr (i64.add (local.get $ptr) (i64.const 1)))
        (br $scan)))

    (local.set $digits (i64.const 1))
    (local.set $t (local.get $count))
    (block $counted
      (loop $more
        (br_if $counted (i32.lt_u (local.get $t) (i32.const 10)))
        (local.set $t (i32.div_u (local.get $t) (i32.const 10)))
        (local.set $digits (i64.add (local.get $digits) (i64.const 1)))
        (br $more)))

    (local.set $out (call $alloc (i64.add (local.get $digits) (i64.const 11))))
    (call $put (local.get $out) (i32.const 123))
    (call $put (i64.add (local.get $out) (i64.const 1)) (i32.const 34))
    (call $put (i64.add (local.get $out) (i64.const 2)) (i32.const 99))
    (call $put (i64.add (local.get $out) (i64.const 3)) (i32.const 111))
    (call $put (i64.add (local.get $out) (i64.const 4)) (i32.const 117))
    (call $put (i64.add (local.get $out) (i64.const 5)) (i32.const 110))
    (call $put (i64.add (local.get $out) (i64.const 6)) (i32.const 116))
    (call $put (i64.add (local.get $out) (i64.const 7)) (i32.const 34))
    (call $put (i64.add (local.get $out) (i64.const 8)) (i32.const 58))
    (call $put (i64.add (local.get $out) (i64.const 9)) (i32.const 32))

    (local.set $pos (i64.add (local.get $out) (i64.add (i64.const 9) (local.get $digits))))
    (local.set $t (local.get $count))
    (block $written
      (loop $digit
        (call $put (local.get $pos) (i32.add (i32.const 48) (i32.rem_u (local.get $t) (i32.const 10))))
        (local.set $t (i32.div_u (local.get $t) (i32.const 10)))
        (br_if $written (i32.eqz (local.get $t)))
        (local.set $pos (i64.sub (local.get $pos) (i64.const 1)))
        (br $digit)))
    (call $put (i64.add (local.get $out) (i64.add (i64.const 10) (local.get $digits))) (i32.const 125))

    (call $output_set (local.get $out) (i64.add (local.get $digits) (i64.const 11)))
    (i32.const 0))

  (func (export "spin") (result i32)
    (loop $forever (br $forever))
    (i32.const 0))

  (func (export "fail") (result i32)
    (local $msg i64)
    (local.set $msg (call $alloc (i64.const 4)))
    (call $put (local.get $msg) (i32.const 111))
    (call $put (i64.add (local.get $msg) (i64.const 1)) (i32.const 111))
    (call $put (i64.add (local.get $msg) (i64.const 2)) (i32.const 112))
    (call $put (i64.add (local.get $msg) (i64.const 3)) (i32.const 115))
    (call $error_set (local.get $msg))
    (i32.const 1))

  (func (export "nonzero") (result i32)
    (i32.const 7))

  ;; Outputs the value of config key "name".
  (func (export "read_config") (result i32)
    (local $key i64) (local $value i64)
    (local.set $key (call $alloc (i64.const 4)))
    (call $put (local.get $key) (i32.const 110))
    (call $put (i64.add (local.get $key) (i64.const 1)) (i32.const 97))
    (call $put (i64.add (local.get $key) (i64.const 2)) (i32.const 109))
    (call $put (i64.add (local.get $key) (i64.const 3)) (i32.const 101))
    (local.set $value (call $config_get (local.get $key)))
    (call $output_set (local.get $value) (call $length (local.get $value)))
    (i32.const 0))

  ;; Increments the one-byte var "n" and outputs it.
  (func (export "counter") (result i32)
    (local $key i64) (local $current i64) (local $n i32) (local $value i64)
    (local.set $key (call $alloc (i64.const 1)))
    (call $put (local.get $key) (i32.const 110))
    (local.set $current (call $var_get (local.get $key)))
    (if (i64.ne (local.get $current) (i64.const 0))
      (then (local.set $n (call $load_u8 (local.get $current)))))
    (local.set $n (i32.add (local.get $n) (i32.const 1)))
    (local.set $value (call $alloc (i64.const 1)))
    (call $put (local.get $value) (local.get $n))
    (call $var_set (local.get $key) (local.get $value))
    (call $output_set (local.get $value) (i64.const 1))
    (i32.const 0))

  ;; Logs the input and echoes it.
  (func (export "log") (result i32)
    (call $log_info (call $input_offset))
    (call $output_set (call $input_offset) (call $input_length))
    (i32.const 0))

  (func (export "takes_param") (param i32) (result i32)
    (local.get 0))
)
"#;

/// Guest calling back into `host_add`, `host_upper` and `host_touch`.
pub const HOST_WAT: &str = r#"
(module
  (import "env" "extism_input_offset" (func $input_offset (result i64)))
  (import "env" "extism_length" (func $length (param i64) (result i64)))
  (import "env" "extism_alloc" (func $alloc (param i64) (result i64)))
  (import "env" "extism_store_u64" (func $store_u64 (param i64 i64)))
  (import "env" "extism_output_set" (func $output_set (param i64 i64)))
  (import "env" "host_add" (func $host_add (param i64 i64) (result i64)))
  (import "env" "host_upper" (func $host_upper (param i64) (result i64)))
  (import "env" "host_touch" (func $host_touch))

  (func (export "add") (result i32)
    (local $out i64)
    (local.set $out (call $alloc (i64.const 8)))
    (call $store_u64 (local.get $out) (call $host_add (i64.const 40) (i64.const 2)))
    (call $output_set (local.get $out) (i64.const 8))
    (i32.const 0))

  (func (export "upper") (result i32)
    (local $result i64)
    (local.set $result (call $host_upper (call $input_offset)))
    (call $output_set (local.get $result) (call $length (local.get $result)))
    (i32.const 0))

  (func (export "touch") (result i32)
    (call $host_touch)
    (i32.const 0))
)
"#;

/// Guest importing `custom::answer`.
pub const NAMESPACE_WAT: &str = r#"
(module
  (import "custom" "answer" (func $answer (result i32)))
  (func (export "check") (result i32)
    (if (result i32) (i32.eq (call $answer) (i32.const 42))
      (then (i32.const 0))
      (else (i32.const 1))))
)
"#;

/// Guest blocking in `host_nap`, then re-entering wasm code.
pub const NAP_WAT: &str = r#"
(module
  (import "env" "host_nap" (func $host_nap))
  (func $settle)
  (func (export "nap") (result i32)
    (call $host_nap)
    (call $settle)
    (i32.const 0))
)
"#;

/// `host_add` that counts its invocations in `calls`.
pub fn host_add(calls: UserData<u64>) -> Function {
    Function::new("host_add", [PTR, PTR], [PTR], calls, |_plugin, inputs, outputs, calls| {
        let a: i64 = inputs[0].get()?;
        let b: i64 = inputs[1].get()?;
        outputs[0].set(a + b);
        *calls.get() += 1;
        Ok(())
    })
    .unwrap()
}

/// `host_upper`: upper-cases the block at its argument into a new block.
pub fn host_upper() -> Function {
    Function::new("host_upper", [PTR], [PTR], UserData::new(()), |plugin, inputs, outputs, _| {
        let offset: u64 = inputs[0].get()?;
        let upper = plugin.read_str(offset)?.to_uppercase();
        let result = plugin.alloc_bytes(upper)?;
        outputs[0].set(result);
        Ok(())
    })
    .unwrap()
}

/// `host_touch`: increments the `u32` host context of the call.
pub fn host_touch() -> Function {
    Function::new("host_touch", [], [], UserData::new(()), |plugin, _, _, _| {
        match plugin.host_context::<u32>() {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(Error::host("no host context")),
        }
    })
    .unwrap()
}

pub fn host_functions() -> Vec<Function> {
    vec![host_add(UserData::new(0)), host_upper(), host_touch()]
}
