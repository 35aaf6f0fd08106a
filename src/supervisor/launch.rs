//! llama-server CLI argument generation
//!
//! Builds the argument vector for `llama-server` from a schemaless
//! parameter map, normalizing the common aliases.

use std::collections::HashMap;

use serde_json::Value;

/// Generate CLI arguments for llama-server
///
/// # Supported Parameters
/// - `n_ctx` / `ctx_size`: Context size
/// - `n_gpu_layers` / `ngl`: Number of layers to offload to GPU
/// - `n_threads` / `threads`: Number of threads
/// - `n_batch`: Batch size for prompt processing
/// - `flash_attn` / `fa`: Enable flash attention
/// - `mlock`, `no_mmap`, `embedding`, `cont_batching`: Boolean switches
///
/// Unknown keys pass through as `--key-with-dashes value`.
pub fn generate_args(
    model: &str,
    host: &str,
    port: u16,
    params: &HashMap<String, Value>,
) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        model.to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();

    for key in keys {
        let value = &params[key];
        let arg_name = match key.as_str() {
            "n_ctx" | "ctx_size" => "--ctx-size".to_string(),
            "n_gpu_layers" | "ngl" => "--n-gpu-layers".to_string(),
            "n_threads" | "threads" => "--threads".to_string(),
            "n_batch" => "--batch-size".to_string(),
            "flash_attn" | "fa" => "--flash-attn".to_string(),
            _ => format!("--{}", key.replace('_', "-")),
        };

        match value {
            Value::Bool(b) => {
                if *b {
                    args.push(arg_name);
                }
            }
            Value::Number(n) => {
                args.push(arg_name);
                args.push(n.to_string());
            }
            Value::String(s) => {
                args.push(arg_name);
                args.push(s.clone());
            }
            _ => {}
        }
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_args_basic() {
        let params = HashMap::new();
        let args = generate_args("/path/to/model.gguf", "127.0.0.1", 8081, &params);

        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"/path/to/model.gguf".to_string()));
        assert!(args.contains(&"--host".to_string()));
        assert!(args.contains(&"--port".to_string()));
        assert!(args.contains(&"8081".to_string()));
    }

    #[test]
    fn test_generate_args_with_params() {
        let mut params = HashMap::new();
        params.insert("n_ctx".to_string(), Value::Number(4096.into()));
        params.insert("n_gpu_layers".to_string(), Value::Number(35.into()));
        params.insert("flash_attn".to_string(), Value::Bool(true));

        let args = generate_args("/model.gguf", "127.0.0.1", 8081, &params);

        assert!(args.contains(&"--ctx-size".to_string()));
        assert!(args.contains(&"4096".to_string()));
        assert!(args.contains(&"--n-gpu-layers".to_string()));
        assert!(args.contains(&"35".to_string()));
        assert!(args.contains(&"--flash-attn".to_string()));
    }

    #[test]
    fn test_parameter_aliases() {
        let mut params = HashMap::new();
        params.insert("ctx_size".to_string(), Value::Number(2048.into()));
        params.insert("ngl".to_string(), Value::Number(20.into()));
        params.insert("fa".to_string(), Value::Bool(true));

        let args = generate_args("m.gguf", "127.0.0.1", 8081, &params);

        assert!(args.contains(&"--ctx-size".to_string()));
        assert!(args.contains(&"--n-gpu-layers".to_string()));
        assert!(args.contains(&"--flash-attn".to_string()));
    }

    #[test]
    fn test_false_bool_omitted() {
        let mut params = HashMap::new();
        params.insert("mlock".to_string(), Value::Bool(false));

        let args = generate_args("m.gguf", "127.0.0.1", 8081, &params);
        assert!(!args.contains(&"--mlock".to_string()));
    }

    #[test]
    fn test_args_are_deterministic() {
        let mut params = HashMap::new();
        params.insert("n_ctx".to_string(), Value::Number(2048.into()));
        params.insert("threads".to_string(), Value::Number(8.into()));

        let a = generate_args("m.gguf", "127.0.0.1", 8081, &params);
        let b = generate_args("m.gguf", "127.0.0.1", 8081, &params);
        assert_eq!(a, b);
    }
}
