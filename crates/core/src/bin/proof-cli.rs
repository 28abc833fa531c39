//! Proof CLI Tool
//!
//! Command-line interface for digesting payloads, building Merkle trees, generating
//! inclusion proofs and verifying them independently of the anchoring service.

use carechain_core::{digest, digest_value, verify_proof, Digest, MerkleProof, MerkleTree};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;

/// Serializable tree info
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeInfo {
    merkle_root: Digest,
    height: usize,
    leaves: Vec<Digest>,
}

/// Proof file written by `prove` and read by `verify`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProofFile {
    leaf_digest: Digest,
    merkle_root: Digest,
    proof: MerkleProof,
}

/// JSON output for verify command
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyOutput {
    valid: bool,
    leaf_digest: String,
    merkle_root: String,
    message: String,
}

fn to_pretty<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize output: {}", e))
}

/// One leaf per line: a 64-char hex digest is taken as-is, anything else is hashed.
fn read_leaves_from_file(path: &PathBuf) -> io::Result<Vec<Digest>> {
    let file = fs::File::open(path)?;
    let reader = io::BufReader::new(file);
    let mut leaves = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match Digest::from_hex(line) {
            Ok(d) => leaves.push(d),
            Err(_) => leaves.push(digest::digest_bytes(line.as_bytes())),
        }
    }

    Ok(leaves)
}

fn cmd_digest(input: PathBuf, json: bool) -> Result<(), String> {
    let raw = fs::read_to_string(&input).map_err(|e| format!("Failed to read input: {}", e))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| format!("Input is not JSON: {}", e))?;
    let d = digest_value(&value);

    if json {
        println!("{}", to_pretty(&serde_json::json!({ "digest": d }))?);
    } else {
        println!("{}", d);
    }
    Ok(())
}

fn cmd_build(input: PathBuf, output: Option<PathBuf>, json: bool) -> Result<(), String> {
    let leaves =
        read_leaves_from_file(&input).map_err(|e| format!("Failed to read input: {}", e))?;

    if leaves.is_empty() {
        return Err("No leaves found in input file".to_string());
    }

    let tree =
        MerkleTree::build(leaves.clone()).map_err(|e| format!("Failed to build tree: {}", e))?;

    let info = TreeInfo {
        merkle_root: tree.root().clone(),
        height: tree.height(),
        leaves,
    };

    if json {
        println!(
            "{}",
            to_pretty(&serde_json::json!({
                "merkleRoot": info.merkle_root,
                "leafCount": tree.leaf_count(),
                "height": info.height,
            }))?
        );
    } else {
        println!("Merkle root: {}", info.merkle_root);
        println!("Leaf count: {}", tree.leaf_count());
        println!("Height: {}", info.height);
    }

    if let Some(output_path) = output {
        fs::write(&output_path, to_pretty(&info)?)
            .map_err(|e| format!("Failed to write output: {}", e))?;
        if !json {
            println!("Tree saved to: {}", output_path.display());
        }
    }

    Ok(())
}

fn cmd_prove(
    tree_path: PathBuf,
    leaf_index: usize,
    output: Option<PathBuf>,
    json: bool,
) -> Result<(), String> {
    let tree_json =
        fs::read_to_string(&tree_path).map_err(|e| format!("Failed to read tree file: {}", e))?;
    let info: TreeInfo = serde_json::from_str(&tree_json)
        .map_err(|e| format!("Failed to parse tree file: {}", e))?;

    let tree = MerkleTree::build(info.leaves).map_err(|e| format!("Failed to rebuild tree: {}", e))?;
    if tree.root() != &info.merkle_root {
        return Err(format!(
            "Tree file is inconsistent: stored root {} != rebuilt root {}",
            info.merkle_root,
            tree.root()
        ));
    }

    let proof = tree
        .generate_proof(leaf_index)
        .map_err(|e| format!("Failed to generate proof: {}", e))?;

    let proof_file = ProofFile {
        leaf_digest: tree.leaves()[leaf_index].clone(),
        merkle_root: tree.root().clone(),
        proof,
    };

    if json {
        println!("{}", to_pretty(&proof_file)?);
    } else {
        println!("Proof generated for leaf {}", leaf_index);
        println!("Leaf digest: {}", proof_file.leaf_digest);
        println!("Merkle root: {}", proof_file.merkle_root);
        println!("Steps: {}", proof_file.proof.len());
    }

    if let Some(output_path) = output {
        fs::write(&output_path, to_pretty(&proof_file)?)
            .map_err(|e| format!("Failed to write proof: {}", e))?;
        if !json {
            println!("Proof saved to: {}", output_path.display());
        }
    }

    Ok(())
}

fn cmd_verify(proof_path: PathBuf, json: bool) -> Result<(), String> {
    let proof_json =
        fs::read_to_string(&proof_path).map_err(|e| format!("Failed to read proof file: {}", e))?;
    let file: ProofFile = serde_json::from_str(&proof_json)
        .map_err(|e| format!("Failed to parse proof file: {}", e))?;

    let valid = verify_proof(&file.leaf_digest, &file.proof, &file.merkle_root);

    if json {
        let output = VerifyOutput {
            valid,
            leaf_digest: file.leaf_digest.to_string(),
            merkle_root: file.merkle_root.to_string(),
            message: if valid {
                "Proof is valid".to_string()
            } else {
                "Proof is invalid".to_string()
            },
        };
        println!("{}", to_pretty(&output)?);
    } else if valid {
        println!("✓ Proof is VALID");
        println!("  Leaf: {}", file.leaf_digest);
        println!("  Root: {}", file.merkle_root);
    } else {
        println!("✗ Proof is INVALID");
    }

    if valid {
        Ok(())
    } else {
        Err("Proof verification failed".to_string())
    }
}

fn parse_args() -> Result<(String, Vec<String>), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Err("Usage: proof-cli <command> [options]".to_string());
    }

    Ok((args[1].clone(), args[2..].to_vec()))
}

/// Collect `--flag value` pairs and bare `--json`
struct Flags {
    values: Vec<(String, String)>,
    json: bool,
}

impl Flags {
    fn parse(args: &[String]) -> Self {
        let mut values = Vec::new();
        let mut json = false;
        let mut i = 0;
        while i < args.len() {
            if args[i] == "--json" {
                json = true;
            } else if args[i].starts_with('-') && i + 1 < args.len() {
                values.push((args[i].clone(), args[i + 1].clone()));
                i += 1;
            }
            i += 1;
        }
        Self { values, json }
    }

    fn get(&self, long: &str, short: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == long || k == short)
            .map(|(_, v)| v.as_str())
    }

    fn path(&self, long: &str, short: &str) -> Option<PathBuf> {
        self.get(long, short).map(PathBuf::from)
    }
}

fn print_usage() {
    println!("Proof CLI - Digest payloads, build Merkle trees, verify inclusion proofs");
    println!();
    println!("USAGE:");
    println!("    proof-cli digest --input <payload.json> [--json]");
    println!("    proof-cli build --input <file> [--output <file>] [--json]");
    println!("    proof-cli prove --tree <file> --leaf-index <n> [--output <file>] [--json]");
    println!("    proof-cli verify --proof <file> [--json]");
    println!();
    println!("COMMANDS:");
    println!("    digest    Canonical BLAKE3 digest of a JSON payload");
    println!("    build     Build a Merkle tree from leaf digests (one per line)");
    println!("    prove     Generate a proof for a specific leaf");
    println!("    verify    Verify a Merkle proof");
    println!();
    println!("EXAMPLES:");
    println!("    proof-cli build --input digests.txt --output tree.json");
    println!("    proof-cli prove --tree tree.json --leaf-index 2 --output proof.json");
    println!("    proof-cli verify --proof proof.json");
}

fn main() {
    let (command, args) = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            println!();
            print_usage();
            process::exit(1);
        }
    };

    let flags = Flags::parse(&args);

    let result = match command.as_str() {
        "digest" => match flags.path("--input", "-i") {
            Some(input) => cmd_digest(input, flags.json),
            None => Err("Missing --input argument".to_string()),
        },
        "build" => match flags.path("--input", "-i") {
            Some(input) => cmd_build(input, flags.path("--output", "-o"), flags.json),
            None => Err("Missing --input argument".to_string()),
        },
        "prove" => {
            let leaf_index = flags
                .get("--leaf-index", "-l")
                .and_then(|v| v.parse::<usize>().ok());
            match (flags.path("--tree", "-t"), leaf_index) {
                (Some(tree), Some(idx)) => {
                    cmd_prove(tree, idx, flags.path("--output", "-o"), flags.json)
                }
                (None, _) => Err("Missing --tree argument".to_string()),
                (_, None) => Err("Missing or invalid --leaf-index argument".to_string()),
            }
        }
        "verify" => match flags.path("--proof", "-p") {
            Some(proof) => cmd_verify(proof, flags.json),
            None => Err("Missing --proof argument".to_string()),
        },
        _ => {
            print_usage();
            Err(format!("Unknown command: {}", command))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
