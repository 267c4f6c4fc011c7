// SPDX-FileCopyrightText: © 2023 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

/// Write a configuration template, refusing to overwrite an existing file.
pub fn create_template(path: &str, content: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!path.is_empty(), "empty template path");
    match std::path::Path::new(&path).exists() {
        true => anyhow::bail!("cannot overwrite configuration file: {}", path),
        false => {
            std::fs::write(path, content)?;
            log::info!("configuration template written to {}", path);
            Ok(())
        }
    }
}

/// Strip the leading and trailing line breaks of a command output.
/// Other whitespace is significant and kept.
pub fn trim_output(output: &str) -> String {
    output.trim_matches(['\n', '\r']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_output() {
        assert_eq!("active", trim_output("active\n"));
        assert_eq!("active", trim_output("active\r\n\n"));
        assert_eq!("  mpirun (Open MPI) 4.0.3", trim_output("  mpirun (Open MPI) 4.0.3\n"));
        assert_eq!("", trim_output("\n"));
        assert_eq!("Version: 4.0.3", trim_output("\nVersion: 4.0.3\n"));
    }

    #[test]
    fn test_create_template_no_overwrite() {
        let path = std::env::temp_dir().join(format!("slurmd-deploy-template-{}.toml", uuid::Uuid::new_v4()));
        let path = path.to_str().unwrap().to_string();
        create_template(&path, "a = 1").unwrap();
        assert!(create_template(&path, "a = 2").is_err());
        assert_eq!("a = 1", std::fs::read_to_string(&path).unwrap());
        std::fs::remove_file(&path).unwrap();
    }
}
